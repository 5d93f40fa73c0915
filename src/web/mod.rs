//! HTTP surface: every handler answers JSON or a redirect.

mod accounts;
mod feedback;
mod management;
mod questionnaires;

use anyhow::Result;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::ai::FeedbackGenerator;
use crate::db::Database;
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Database>>,
    generator: Arc<FeedbackGenerator>,
}

impl AppState {
    pub fn new(db: Database, generator: FeedbackGenerator) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            generator: Arc::new(generator),
        }
    }

    /// Runs `f` with the database locked. Never hold this across an `.await`.
    pub fn with_db<T>(&self, f: impl FnOnce(&Database) -> AppResult<T>) -> AppResult<T> {
        let db = self
            .db
            .lock()
            .map_err(|_| AppError::Internal("database lock poisoned".to_string()))?;
        f(&*db)
    }

    pub fn generator(&self) -> &FeedbackGenerator {
        &self.generator
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Accounts
        .route("/", get(accounts::index))
        .route("/health", get(accounts::health))
        .route("/register", post(accounts::register))
        .route("/login", post(accounts::login))
        .route("/logout", post(accounts::logout))
        .route("/home", get(accounts::home))
        .route("/get_team_members", get(accounts::team_members))
        .route(
            "/profile",
            get(accounts::profile).put(accounts::update_profile),
        )
        // Feedback
        .route("/request_feedback", post(feedback::request_feedback))
        .route("/send_feedback/:user_id", post(feedback::send_feedback))
        .route(
            "/feedback/fill/:request_id",
            get(feedback::fill_form).post(feedback::submit_form),
        )
        .route("/team", get(feedback::team))
        .route("/tasks/dashboard", get(feedback::tasks_dashboard))
        .route("/results", get(feedback::results))
        .route("/generate_ai_feedback", post(feedback::generate_ai_feedback))
        .route("/all_feedback", get(feedback::all_feedback))
        .route("/get_feedback_data", get(feedback::feedback_data))
        .route("/departments/:id/stats", get(feedback::department_stats))
        // Questionnaires
        .route(
            "/questionnaires",
            get(questionnaires::list).post(questionnaires::create),
        )
        .route(
            "/questionnaires/:id",
            get(questionnaires::show)
                .put(questionnaires::update)
                .delete(questionnaires::remove),
        )
        .route(
            "/traits",
            get(questionnaires::list_traits).post(questionnaires::create_trait),
        )
        // Management
        .route("/management", get(management::overview))
        .route("/management/companies", post(management::create_company))
        .route("/management/companies/:id", delete(management::delete_company))
        .route("/management/departments", post(management::create_department))
        .route(
            "/management/departments/:id",
            put(management::update_department).delete(management::delete_department),
        )
        .route("/management/employees/:user_id", put(management::update_employee))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}
