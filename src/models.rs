use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const RATING_MIN: i64 = 1;
pub const RATING_MAX: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_superuser: bool,
    pub date_joined: String,
}

impl User {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Department {
    pub id: i64,
    pub company_id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub manager_id: Option<i64>,
}

/// Department with its sub-departments, for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartmentTree {
    pub id: i64,
    pub name: String,
    pub manager_id: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<DepartmentTree>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub user_id: i64,
    pub company_id: Option<i64>,
    pub company_name: Option<String>, // denormalized for convenience
    pub department_id: Option<i64>,
    pub manager_id: Option<i64>,
    pub is_company_admin: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Employee {
    #[serde(flatten)]
    pub user: User,
    pub profile: Option<Profile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Completed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "completed" => Some(RequestStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub id: i64,
    pub requester_id: i64,
    pub requester_name: String,
    pub requested_to_id: i64,
    pub requested_to_name: String,
    pub project_name: String,
    pub comment: Option<String>,
    pub due_date: NaiveDate,
    pub status: RequestStatus,
    pub questionnaire_id: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: i64,
    pub feedback_request_id: i64,
    pub rating: i64,
    pub teamwork_rating: i64,
    pub communication_rating: i64,
    pub initiative_rating: i64,
    pub technical_skills_rating: i64,
    pub problem_solving_rating: i64,
    pub keywords: String,
    pub comments: String,
    pub feedback: String,
    pub created_at: String,
}

/// Completed feedback joined with the people involved, for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    #[serde(flatten)]
    pub feedback: Feedback,
    pub project_name: String,
    pub subject_id: i64,
    pub subject_name: String,
    pub author_id: i64,
    pub author_name: String,
}

/// Values a reviewer submits for a feedback request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFeedback {
    pub rating: i64,
    #[serde(default = "default_competency_rating")]
    pub teamwork_rating: i64,
    #[serde(default = "default_competency_rating")]
    pub communication_rating: i64,
    #[serde(default = "default_competency_rating")]
    pub initiative_rating: i64,
    #[serde(default = "default_competency_rating")]
    pub technical_skills_rating: i64,
    #[serde(default = "default_competency_rating")]
    pub problem_solving_rating: i64,
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub comments: String,
    pub feedback: String,
    #[serde(default)]
    pub trait_ratings: Vec<TraitScore>,
}

fn default_competency_rating() -> i64 {
    5
}

impl NewFeedback {
    /// Checks every rating is on the 1-10 scale.
    pub fn validate(&self) -> Result<(), String> {
        let named = [
            ("rating", self.rating),
            ("teamwork_rating", self.teamwork_rating),
            ("communication_rating", self.communication_rating),
            ("initiative_rating", self.initiative_rating),
            ("technical_skills_rating", self.technical_skills_rating),
            ("problem_solving_rating", self.problem_solving_rating),
        ];
        for (field, value) in named {
            if !(RATING_MIN..=RATING_MAX).contains(&value) {
                return Err(format!(
                    "{} must be between {} and {}, got {}",
                    field, RATING_MIN, RATING_MAX, value
                ));
            }
        }
        let mut seen = BTreeSet::new();
        for score in &self.trait_ratings {
            if !seen.insert(score.trait_id) {
                return Err(format!("trait {} is rated more than once", score.trait_id));
            }
            if !(RATING_MIN..=RATING_MAX).contains(&score.rating) {
                return Err(format!(
                    "trait {} rating must be between {} and {}, got {}",
                    score.trait_id, RATING_MIN, RATING_MAX, score.rating
                ));
            }
        }
        if self.feedback.trim().is_empty() {
            return Err("feedback text is required".to_string());
        }
        Ok(())
    }
}

/// Overall rating plus the five competencies. Values may be averages and
/// any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ratings {
    pub rating: Option<f64>,
    pub teamwork: Option<f64>,
    pub communication: Option<f64>,
    pub initiative: Option<f64>,
    pub technical_skills: Option<f64>,
    pub problem_solving: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trait {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Questionnaire {
    pub id: i64,
    pub title: String,
    pub created_by: i64,
    pub created_at: String,
    pub traits: Vec<Trait>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitScore {
    pub trait_id: i64,
    pub rating: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitRating {
    pub feedback_id: i64,
    pub trait_id: i64,
    pub trait_name: String,
    pub rating: i64,
}
