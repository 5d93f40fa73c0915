use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::Ratings;

// --- Provider trait ---

#[async_trait]
pub trait AIProvider: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub enum ProviderKind {
    Gemini,
    Anthropic,
    OpenAI,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

pub fn resolve_model(name: &str) -> Result<ModelSpec> {
    let spec = |provider, model_id: &str, short_name: &str| ModelSpec {
        provider,
        model_id: model_id.to_string(),
        short_name: short_name.to_string(),
    };

    match name {
        // Google Gemini (requires GEMINI_API_KEY)
        "gemini" | "gemini-1.5-flash" => Ok(spec(ProviderKind::Gemini, "gemini-1.5-flash", "gemini-1.5-flash")),
        "gemini-1.5-pro" => Ok(spec(ProviderKind::Gemini, "gemini-1.5-pro", "gemini-1.5-pro")),
        "gemini-2.0-flash" => Ok(spec(ProviderKind::Gemini, "gemini-2.0-flash", "gemini-2.0-flash")),
        // Anthropic API (requires ANTHROPIC_API_KEY)
        "api-sonnet" | "sonnet" => Ok(spec(ProviderKind::Anthropic, "claude-sonnet-4-5-20250929", "api-sonnet")),
        "api-haiku" | "haiku" => Ok(spec(ProviderKind::Anthropic, "claude-haiku-4-5-20251001", "api-haiku")),
        // OpenAI (requires OPENAI_API_KEY)
        "gpt-4o" => Ok(spec(ProviderKind::OpenAI, "gpt-4o", "gpt-4o")),
        "gpt-4o-mini" => Ok(spec(ProviderKind::OpenAI, "gpt-4o-mini", "gpt-4o-mini")),
        other if other.starts_with("gemini-") => Ok(spec(ProviderKind::Gemini, other, other)),
        _ => Err(anyhow!(
            "Unknown model '{}'. Available: gemini-1.5-flash (default), gemini-1.5-pro, \
             gemini-2.0-flash, api-sonnet, api-haiku, gpt-4o, gpt-4o-mini",
            name
        )),
    }
}

pub fn create_provider(spec: &ModelSpec) -> Result<Arc<dyn AIProvider>> {
    match spec.provider {
        ProviderKind::Gemini => Ok(Arc::new(GeminiProvider::new(spec.model_id.clone())?)),
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicProvider::new(spec.model_id.clone())?)),
        ProviderKind::OpenAI => Ok(Arc::new(OpenAIProvider::new(spec.model_id.clone())?)),
    }
}

// --- Gemini provider ---

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug)]
pub struct GeminiProvider {
    api_key: String,
    model_id: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("GEMINI_API_KEY")
            .context("GEMINI_API_KEY environment variable not set. Set it with: export GEMINI_API_KEY=your-key-here")?;
        let client = reqwest::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

#[async_trait]
impl AIProvider for GeminiProvider {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: max_tokens,
            },
        };

        let url = format!("{}/{}:generateContent", GEMINI_API_URL, self.model_id);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Gemini API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Gemini API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: GeminiResponse = response
            .json()
            .await
            .context("Failed to parse Gemini API response")?;

        api_response
            .candidates
            .first()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .iter()
                    .map(|part| part.text.as_str())
                    .collect::<String>()
            })
            .ok_or_else(|| anyhow!("No candidates in Gemini API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable not set. Set it with: export ANTHROPIC_API_KEY=your-key-here")?;
        let client = reqwest::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

#[async_trait]
impl AIProvider for AnthropicProvider {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = AnthropicRequest {
            model: self.model_id.clone(),
            max_tokens,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Anthropic API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic API response")?;

        api_response
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| anyhow!("No content in Anthropic API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<OpenAIMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug)]
pub struct OpenAIProvider {
    api_key: String,
    model_id: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set. Set it with: export OPENAI_API_KEY=your-key-here")?;
        let client = reqwest::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

#[async_trait]
impl AIProvider for OpenAIProvider {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = OpenAIRequest {
            model: self.model_id.clone(),
            max_tokens,
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "OpenAI API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: OpenAIResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI API response")?;

        api_response
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .ok_or_else(|| anyhow!("No choices in OpenAI API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Feedback generation ---

const FEEDBACK_MAX_TOKENS: u32 = 1024;

/// Everything the narrative is built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationInput {
    #[serde(default)]
    pub ratings: Ratings,
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub existing_feedback: String,
    pub colleague_name: String,
}

/// Turns ratings and comments into a prose narrative via an [`AIProvider`].
/// One call per invocation: no retries, no caching.
pub struct FeedbackGenerator {
    provider: Option<Arc<dyn AIProvider>>,
}

impl FeedbackGenerator {
    pub fn new(provider: Arc<dyn AIProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    /// A generator that fails every request, used when no API key is configured.
    pub fn unconfigured() -> Self {
        Self { provider: None }
    }

    /// Builds the generator for `model`, falling back to an unconfigured one
    /// when the provider cannot be created.
    pub fn from_model(model: &str) -> Result<Self> {
        let spec = resolve_model(model)?;
        match create_provider(&spec) {
            Ok(provider) => {
                debug!(model = %spec.short_name, model_id = %spec.model_id, "AI provider ready");
                Ok(Self::new(provider))
            }
            Err(e) => {
                warn!(model = %spec.short_name, "AI feedback generation disabled: {:#}", e);
                Ok(Self::unconfigured())
            }
        }
    }

    pub fn model_name(&self) -> Option<&str> {
        self.provider.as_ref().map(|p| p.model_name())
    }

    pub async fn generate(&self, input: &GenerationInput) -> Result<String> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| anyhow!("No AI provider configured"))?;
        let prompt = build_prompt(input);
        debug!(
            model = provider.model_name(),
            prompt_len = prompt.len(),
            "requesting feedback narrative"
        );
        provider.complete(&prompt, FEEDBACK_MAX_TOKENS).await
    }
}

fn fmt_rating(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 => format!("{}", v as i64),
        Some(v) => format!("{:.2}", v),
        None => "n/a".to_string(),
    }
}

pub fn build_prompt(input: &GenerationInput) -> String {
    let name = &input.colleague_name;
    let r = &input.ratings;
    format!(
        "Act as a specific, collegial team member. Be empathetic and give constructive criticism.\n\
        Get straight to the point: no introductions and no sign-offs.\n\
        Your task is to write high-quality, data-driven feedback for your colleague {name}.\n\n\
        Rating scale (1-10), read it as a growth scale:\n\
        - 1-4 = Learning: needs attention and support, this is where to grow.\n\
        - 5-6 = Doing: a solid foundation, meets expectations.\n\
        - 7-8 = Driving: shows initiative and pulls the team forward.\n\
        - 9-10 = Role model: others should learn from this.\n\n\
        No formatting: do not use markdown, asterisks, bullet points, headings or labels such as \
        \"Situation:\", \"Behaviour:\" or \"Impact:\". Write plain paragraphs only, like a short \
        message from a colleague. Keep it between 160 and 180 words.\n\
        Use Situation-Behaviour-Impact reasoning, woven naturally into the sentences.\n\n\
        Data:\n\
        Competency levels (1-10):\n\
        Overall: {overall}\n\
        Teamwork: {teamwork}\n\
        Communication: {communication}\n\
        Initiative: {initiative}\n\
        Technical skills: {technical}\n\
        Problem solving: {problem}\n\
        Keywords: {keywords}\n\
        Comments: {comments}\n\
        Additional context: {existing}\n\n\
        Instructions: write cohesive feedback in English addressed to {name}.\n\
        1. Strengths (7-10): name them as exemplary and state the positive impact they have.\n\
        2. Stability (5-6): describe these as steady, reliable work that meets expectations.\n\
        3. Growth areas (1-4): do not criticise the person. Frame them as a chance to learn, \
        explain the situation and behaviour behind the score and suggest how to reach the next level.\n\
        4. Weave the comments and keywords into the text so they do not read like a separate list.\n\n\
        The text must be motivating, professional and clear.",
        name = name,
        overall = fmt_rating(r.rating),
        teamwork = fmt_rating(r.teamwork),
        communication = fmt_rating(r.communication),
        initiative = fmt_rating(r.initiative),
        technical = fmt_rating(r.technical_skills),
        problem = fmt_rating(r.problem_solving),
        keywords = input.keywords,
        comments = input.comments,
        existing = input.existing_feedback,
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Provider that records prompts and answers with a canned result.
    pub(crate) struct StubProvider {
        pub reply: Result<String, String>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl StubProvider {
        pub(crate) fn ok(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(vec![]),
            }
        }

        pub(crate) fn failing(message: &str) -> Self {
            Self {
                reply: Err(message.to_string()),
                prompts: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl AIProvider for StubProvider {
        async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone().map_err(|e| anyhow!(e))
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn sample_input() -> GenerationInput {
        GenerationInput {
            ratings: Ratings {
                rating: Some(8.0),
                teamwork: Some(9.0),
                communication: Some(6.5),
                initiative: Some(7.0),
                technical_skills: Some(3.0),
                problem_solving: None,
            },
            keywords: "Careful, Analytical".to_string(),
            comments: "Shipped the billing migration on time".to_string(),
            existing_feedback: "Mentored two juniors".to_string(),
            colleague_name: "Ona Petraitė".to_string(),
        }
    }

    #[test]
    fn test_resolve_model_gemini() {
        let spec = resolve_model("gemini").unwrap();
        assert_eq!(spec.model_id, "gemini-1.5-flash");
        assert!(matches!(spec.provider, ProviderKind::Gemini));

        let spec = resolve_model(DEFAULT_MODEL).unwrap();
        assert!(matches!(spec.provider, ProviderKind::Gemini));

        let spec = resolve_model("gemini-exp-1206").unwrap();
        assert_eq!(spec.model_id, "gemini-exp-1206");
    }

    #[test]
    fn test_resolve_model_other_providers() {
        let spec = resolve_model("api-sonnet").unwrap();
        assert_eq!(spec.model_id, "claude-sonnet-4-5-20250929");
        assert!(matches!(spec.provider, ProviderKind::Anthropic));

        let spec = resolve_model("gpt-4o").unwrap();
        assert!(matches!(spec.provider, ProviderKind::OpenAI));
    }

    #[test]
    fn test_resolve_model_aliases_share_short_name() {
        let spec = resolve_model("sonnet").unwrap();
        assert_eq!(spec.short_name, "api-sonnet");
        let spec = resolve_model("gemini").unwrap();
        assert_eq!(spec.short_name, "gemini-1.5-flash");
    }

    #[test]
    fn test_resolve_model_unknown() {
        assert!(resolve_model("gpt-3").is_err());
    }

    #[test]
    fn test_gemini_provider_requires_api_key() {
        let original = env::var("GEMINI_API_KEY").ok();
        unsafe { env::remove_var("GEMINI_API_KEY"); }

        let result = GeminiProvider::new("gemini-1.5-flash".to_string());

        if let Some(val) = original {
            unsafe { env::set_var("GEMINI_API_KEY", val); }
        }

        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("GEMINI_API_KEY"));
    }

    #[test]
    fn test_openai_provider_with_api_key() {
        unsafe { env::set_var("OPENAI_API_KEY", "test-key"); }

        let result = OpenAIProvider::new("gpt-4o".to_string());
        assert!(result.is_ok());
        assert_eq!(result.unwrap().model_name(), "gpt-4o");

        unsafe { env::remove_var("OPENAI_API_KEY"); }
    }

    #[test]
    fn test_prompt_contains_inputs() {
        let prompt = build_prompt(&sample_input());
        assert!(prompt.contains("colleague Ona Petraitė"));
        assert!(prompt.contains("Overall: 8\n"));
        assert!(prompt.contains("Communication: 6.50"));
        assert!(prompt.contains("Technical skills: 3\n"));
        assert!(prompt.contains("Problem solving: n/a"));
        assert!(prompt.contains("Keywords: Careful, Analytical"));
        assert!(prompt.contains("Comments: Shipped the billing migration on time"));
        assert!(prompt.contains("Additional context: Mentored two juniors"));
    }

    #[test]
    fn test_generation_input_defaults() {
        let input: GenerationInput =
            serde_json::from_str(r#"{"colleague_name": "Jonas", "ratings": {"rating": 4}}"#).unwrap();
        assert_eq!(input.ratings.rating, Some(4.0));
        assert_eq!(input.ratings.teamwork, None);
        assert!(input.keywords.is_empty());
    }

    #[tokio::test]
    async fn test_generate_returns_response_verbatim() {
        let stub = Arc::new(StubProvider::ok("  Great quarter, Ona.\n\n"));
        let generator = FeedbackGenerator::new(stub.clone());

        let text = generator.generate(&sample_input()).await.unwrap();
        assert_eq!(text, "  Great quarter, Ona.\n\n");

        let prompts = stub.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Ona Petraitė"));
    }

    #[tokio::test]
    async fn test_generate_propagates_failure_without_retry() {
        let stub = Arc::new(StubProvider::failing("quota exceeded"));
        let generator = FeedbackGenerator::new(stub.clone());

        let err = generator.generate(&sample_input()).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(stub.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_generator_fails() {
        let generator = FeedbackGenerator::unconfigured();
        assert!(generator.model_name().is_none());
        assert!(generator.generate(&sample_input()).await.is_err());
    }
}
