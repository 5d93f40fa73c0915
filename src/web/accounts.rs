use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::LazyLock;
use tracing::info;

use super::AppState;
use crate::auth::{
    expired_session_cookie, first_password_match, hash_password_blocking, new_session_token,
    session_cookie, session_token, CurrentUser,
};
use crate::db::{NewUser, ProfileUpdate, UserUpdate};
use crate::error::{AppError, AppResult};
use crate::models::{Employee, FeedbackRequest, RequestStatus, User};

const MIN_PASSWORD_LEN: usize = 8;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern compiles"));

fn check_email(email: &str) -> AppResult<()> {
    if EMAIL_RE.is_match(email.trim()) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid email address '{}'", email)))
    }
}

pub async fn index(user: Option<CurrentUser>) -> Response {
    match user {
        Some(_) => Redirect::to("/home").into_response(),
        None => Json(json!({
            "name": "feedbackas",
            "message": "Welcome. Register or log in to request and give feedback.",
        }))
        .into_response(),
    }
}

pub async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
pub struct RegisterForm {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub company: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub user: User,
}

fn with_session_cookie(status: StatusCode, session: SessionResponse) -> Response {
    let cookie = session_cookie(&session.token);
    (status, [(SET_COOKIE, cookie)], Json(session)).into_response()
}

fn validate_registration(form: &RegisterForm) -> AppResult<()> {
    let username = form.username.trim();
    if username.is_empty() || username.len() > 150 {
        return Err(AppError::Validation("username must be 1-150 characters".into()));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || "@.+-_".contains(c))
    {
        return Err(AppError::Validation(
            "username may only contain letters, digits and @/./+/-/_".into(),
        ));
    }
    check_email(&form.email)?;
    if form.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

pub async fn register(
    State(state): State<AppState>,
    Json(form): Json<RegisterForm>,
) -> AppResult<Response> {
    validate_registration(&form)?;
    let password_hash = hash_password_blocking(form.password.clone()).await?;
    let token = new_session_token();

    let user = state.with_db(|db| {
        let username = form.username.trim();
        if db.username_taken(username)? {
            return Err(AppError::Conflict(format!("username '{}' is taken", username)));
        }
        let user_id = db.create_user(&NewUser {
            username: username.to_string(),
            email: form.email.trim().to_string(),
            first_name: form.first_name.trim().to_string(),
            last_name: form.last_name.trim().to_string(),
            password_hash,
            is_superuser: false,
        })?;

        let company_id = match form.company.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Some(db.get_or_create_company(name)?),
            _ => None,
        };
        db.create_profile(user_id, company_id)?;
        db.create_session(user_id, &token)?;

        db.get_user(user_id)?
            .ok_or_else(|| AppError::Internal("new user vanished".into()))
    })?;

    info!(user_id = user.id, username = %user.username, "registered");
    Ok(with_session_cookie(StatusCode::CREATED, SessionResponse { token, user }))
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    /// Username or email address.
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(form): Json<LoginForm>,
) -> AppResult<Response> {
    let login = form.username.trim();
    let candidates = state.with_db(|db| {
        let mut users: Vec<User> = db.get_user_by_username(login)?.into_iter().collect();
        if users.is_empty() && login.contains('@') {
            users = db.find_users_by_email(login)?;
        }
        Ok(users)
    })?;

    let user = first_password_match(form.password, candidates)
        .await?
        .ok_or_else(|| AppError::Validation("invalid username or password".into()))?;

    let token = new_session_token();
    state.with_db(|db| Ok(db.create_session(user.id, &token)?))?;

    info!(user_id = user.id, "logged in");
    Ok(with_session_cookie(StatusCode::OK, SessionResponse { token, user }))
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    if let Some(token) = session_token(&headers) {
        state.with_db(|db| Ok(db.delete_session(&token)?))?;
    }
    Ok(([(SET_COOKIE, expired_session_cookie())], Redirect::to("/")).into_response())
}

#[derive(Debug, Serialize)]
pub struct HomePage {
    pub user: User,
    pub company_name: String,
    pub pending_requests: Vec<FeedbackRequest>,
}

pub async fn home(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<HomePage>> {
    let (company_name, pending_requests) = state.with_db(|db| {
        let company_name = db
            .get_profile(user.id)?
            .and_then(|p| p.company_name)
            .unwrap_or_default();
        let pending = db.list_requests_assigned(user.id, Some(RequestStatus::Pending))?;
        Ok((company_name, pending))
    })?;

    Ok(Json(HomePage {
        user,
        company_name,
        pending_requests,
    }))
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct TeamMember {
    pub id: i64,
    pub name: String,
}

pub async fn team_members(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<Vec<TeamMember>>> {
    let colleagues = state.with_db(|db| Ok(db.list_colleagues(user.id)?))?;
    Ok(Json(
        colleagues
            .iter()
            .map(|u| TeamMember {
                id: u.id,
                name: u.display_name(),
            })
            .collect(),
    ))
}

// --- Own profile ---

pub async fn profile(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<Employee>> {
    let profile = state.with_db(|db| Ok(db.get_profile(user.id)?))?;
    Ok(Json(Employee { user, profile }))
}

/// Only the caller's own name and email; company, department and admin
/// flags stay with the management pages.
#[derive(Debug, Deserialize)]
pub struct ProfileForm {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

pub async fn update_profile(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(form): Json<ProfileForm>,
) -> AppResult<Json<Employee>> {
    if let Some(email) = &form.email {
        check_email(email)?;
    }
    let trimmed = |value: &Option<String>| value.as_deref().map(|v| v.trim().to_string());
    let update = UserUpdate {
        first_name: trimmed(&form.first_name),
        last_name: trimmed(&form.last_name),
        email: trimmed(&form.email),
    };

    let employee = state.with_db(|db| {
        let user = db.update_user(user.id, &update)?;
        let profile = db.update_profile(user.id, &ProfileUpdate::default())?;
        Ok(Employee {
            user,
            profile: Some(profile),
        })
    })?;
    info!(user_id = employee.user.id, "profile updated");
    Ok(Json(employee))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{json_body, login_as, send, state};
    use axum::http::{header::LOCATION, Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_health() {
        let state = state();
        let response = send(&state, Method::GET, "/health", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_index_redirects_when_logged_in() {
        let state = state();
        let response = send(&state, Method::GET, "/", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let (_, token) = login_as(&state, "ana", false);
        let response = send(&state, Method::GET, "/", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[LOCATION], "/home");
    }

    #[tokio::test]
    async fn test_protected_route_redirects_to_login() {
        let state = state();
        let response = send(&state, Method::GET, "/home", None, None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[LOCATION], "/login");

        let response = send(&state, Method::GET, "/home", Some("bogus"), None).await;
        assert_eq!(response.headers()[LOCATION], "/login");
    }

    #[tokio::test]
    async fn test_register_then_login_with_email() {
        let state = state();
        let body = json!({
            "username": "ona",
            "email": "ona@acme.test",
            "password": "s3cret-pass",
            "first_name": "Ona",
            "company": "Acme"
        });
        let response = send(&state, Method::POST, "/register", None, Some(body.clone())).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key("set-cookie"));
        let registered = json_body(response).await;
        assert_eq!(registered["user"]["username"], "ona");
        assert!(registered["user"].get("password_hash").is_none());

        let response = send(&state, Method::POST, "/register", None, Some(body)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let login = json!({"username": "ona@acme.test", "password": "s3cret-pass"});
        let response = send(&state, Method::POST, "/login", None, Some(login)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let token = json_body(response).await["token"].as_str().unwrap().to_string();

        let response = send(&state, Method::GET, "/home", Some(&token), None).await;
        let home = json_body(response).await;
        assert_eq!(home["company_name"], "Acme");
    }

    #[tokio::test]
    async fn test_register_validation() {
        let state = state();
        let body = json!({"username": "ona", "email": "not-an-email", "password": "s3cret-pass"});
        let response = send(&state, Method::POST, "/register", None, Some(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json!({"username": "ona", "email": "ona@acme.test", "password": "short"});
        let response = send(&state, Method::POST, "/register", None, Some(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let state = state();
        login_as(&state, "ana", false);
        let login = json!({"username": "ana", "password": "nope"});
        let response = send(&state, Method::POST, "/login", None, Some(login)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_own_profile_update() {
        let state = state();
        let (ana, token) = login_as(&state, "ana", false);

        let response = send(&state, Method::GET, "/profile", Some(&token), None).await;
        let page = json_body(response).await;
        assert_eq!(page["username"], "ana");
        assert_eq!(page["profile"], serde_json::Value::Null);

        let body = json!({
            "first_name": " Anna ",
            "email": "anna@acme.test",
            "company_id": 7,
            "is_company_admin": true
        });
        let response = send(&state, Method::PUT, "/profile", Some(&token), Some(body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let page = json_body(response).await;
        assert_eq!(page["first_name"], "Anna");
        assert_eq!(page["last_name"], "Tester");
        assert_eq!(page["email"], "anna@acme.test");
        assert_eq!(page["profile"]["user_id"], ana);
        assert_eq!(page["profile"]["company_id"], serde_json::Value::Null);
        assert_eq!(page["profile"]["is_company_admin"], false);

        let body = json!({"email": "broken"});
        let response = send(&state, Method::PUT, "/profile", Some(&token), Some(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&state, Method::GET, "/profile", None, None).await;
        assert_eq!(response.headers()[LOCATION], "/login");
    }

    #[tokio::test]
    async fn test_logout_ends_session() {
        let state = state();
        let (_, token) = login_as(&state, "ana", false);
        let response = send(&state, Method::POST, "/logout", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[LOCATION], "/");

        let response = send(&state, Method::GET, "/home", Some(&token), None).await;
        assert_eq!(response.headers()[LOCATION], "/login");
    }

    #[tokio::test]
    async fn test_team_members_scoped_to_company() {
        let state = state();
        let (ana, token) = login_as(&state, "ana", false);
        let (ben, _) = login_as(&state, "ben", false);
        let (cid, _) = login_as(&state, "cid", false);

        // No profile yet: everyone else
        let response = send(&state, Method::GET, "/get_team_members", Some(&token), None).await;
        let members = json_body(response).await;
        assert_eq!(members.as_array().unwrap().len(), 2);

        state
            .with_db(|db| {
                let acme = db.create_company("Acme")?;
                let other = db.create_company("Other")?;
                db.create_profile(ana, Some(acme))?;
                db.create_profile(ben, Some(acme))?;
                db.create_profile(cid, Some(other))?;
                Ok(())
            })
            .unwrap();

        let response = send(&state, Method::GET, "/get_team_members", Some(&token), None).await;
        let members = json_body(response).await;
        assert_eq!(members, json!([{"id": ben, "name": "Ben Tester"}]));
    }
}
