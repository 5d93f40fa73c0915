use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::{info, warn};

use super::AppState;
use crate::ai::GenerationInput;
use crate::analytics::{collect_keywords, round1, round2, FeedbackAnalytics, UserStats};
use crate::auth::CurrentUser;
use crate::db::{Database, FeedbackScope, NewFeedbackRequest};
use crate::error::{AppError, AppResult};
use crate::models::{
    Feedback, FeedbackEntry, FeedbackRequest, NewFeedback, Questionnaire, Ratings, RequestStatus,
    TraitRating, User,
};

// --- Access helpers ---

/// Whose received feedback `viewer` may read: everyone for a superuser, the
/// whole company for a company admin, otherwise themselves plus everyone in
/// the departments they manage and their direct reports.
fn visible_subjects(db: &Database, viewer: &User) -> anyhow::Result<FeedbackScope> {
    if viewer.is_superuser {
        return Ok(FeedbackScope::All);
    }
    let profile = db.get_profile(viewer.id)?;
    if let Some(profile) = &profile {
        if profile.is_company_admin {
            if let Some(company_id) = profile.company_id {
                return Ok(FeedbackScope::Company(company_id));
            }
        }
    }

    let mut subjects: BTreeSet<i64> = BTreeSet::new();
    subjects.insert(viewer.id);
    for department in db.departments_managed_by(viewer.id)? {
        let subtree = db.department_subtree_ids(department.id)?;
        subjects.extend(db.member_ids_of_departments(&subtree)?);
    }
    subjects.extend(db.subordinate_ids(viewer.id)?);
    Ok(FeedbackScope::Subjects(subjects.into_iter().collect()))
}

fn can_view_user(db: &Database, viewer: &User, subject_id: i64) -> anyhow::Result<bool> {
    Ok(match visible_subjects(db, viewer)? {
        FeedbackScope::All => true,
        FeedbackScope::Company(company_id) => {
            subject_id == viewer.id
                || db.get_profile(subject_id)?.and_then(|p| p.company_id) == Some(company_id)
        }
        FeedbackScope::Subjects(ids) => ids.contains(&subject_id),
    })
}

/// True when `user_id` manages the department or any department above it.
fn manages_department(db: &Database, user_id: i64, department_id: i64) -> anyhow::Result<bool> {
    for id in db.department_ancestor_ids(department_id)? {
        if db
            .get_department(id)?
            .is_some_and(|d| d.manager_id == Some(user_id))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn scope_label(scope: &FeedbackScope, viewer_id: i64) -> &'static str {
    match scope {
        FeedbackScope::All => "all",
        FeedbackScope::Company(_) => "company",
        FeedbackScope::Subjects(ids) if ids.len() == 1 && ids[0] == viewer_id => "own",
        FeedbackScope::Subjects(_) => "team",
    }
}

// --- Requests ---

#[derive(Debug, Deserialize)]
pub struct RequestForm {
    pub requested_to: i64,
    pub project_name: String,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub questionnaire_id: Option<i64>,
}

pub async fn request_feedback(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(form): Json<RequestForm>,
) -> AppResult<(StatusCode, Json<FeedbackRequest>)> {
    let project_name = form.project_name.trim();
    if project_name.is_empty() {
        return Err(AppError::Validation("project_name is required".into()));
    }
    if form.requested_to == user.id {
        return Err(AppError::Validation("you cannot request feedback from yourself".into()));
    }

    let request = state.with_db(|db| {
        if db.get_user(form.requested_to)?.is_none() {
            return Err(AppError::NotFound(format!("user #{}", form.requested_to)));
        }
        if let Some(questionnaire_id) = form.questionnaire_id {
            let usable = db
                .get_questionnaire(questionnaire_id)?
                .is_some_and(|q| user.is_superuser || q.created_by == user.id);
            if !usable {
                return Err(AppError::NotFound(format!("questionnaire #{}", questionnaire_id)));
            }
        }
        let id = db.create_feedback_request(&NewFeedbackRequest {
            requester_id: user.id,
            requested_to_id: form.requested_to,
            project_name: project_name.to_string(),
            comment: form.comment.clone().filter(|c| !c.trim().is_empty()),
            due_date: form.due_date,
            questionnaire_id: form.questionnaire_id,
        })?;
        db.get_feedback_request(id)?
            .ok_or_else(|| AppError::Internal("new request vanished".into()))
    })?;

    info!(request_id = request.id, requester = user.id, requested_to = request.requested_to_id, "feedback requested");
    Ok((StatusCode::CREATED, Json(request)))
}

#[derive(Debug, Deserialize)]
pub struct SendForm {
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(flatten)]
    pub feedback: NewFeedback,
}

pub async fn send_feedback(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(subject_id): Path<i64>,
    Json(form): Json<SendForm>,
) -> AppResult<(StatusCode, Json<Value>)> {
    if subject_id == user.id {
        return Err(AppError::Validation("you cannot give feedback to yourself".into()));
    }
    form.feedback.validate().map_err(AppError::Validation)?;
    if !form.feedback.trait_ratings.is_empty() {
        return Err(AppError::Validation(
            "trait ratings need a questionnaire-backed request".into(),
        ));
    }
    let project_name = form
        .project_name
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or("General feedback")
        .to_string();

    let (request_id, feedback_id) = state.with_db(|db| {
        if db.get_user(subject_id)?.is_none() {
            return Err(AppError::NotFound(format!("user #{}", subject_id)));
        }
        let today = Local::now().date_naive();
        Ok(db.record_unsolicited_feedback(user.id, subject_id, &project_name, today, &form.feedback)?)
    })?;

    info!(request_id, feedback_id, author = user.id, subject = subject_id, "feedback sent");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "request_id": request_id,
            "feedback_id": feedback_id,
            "status": RequestStatus::Completed,
        })),
    ))
}

// --- Filling in a request ---

#[derive(Debug, Serialize)]
pub struct FillPage {
    pub request: FeedbackRequest,
    pub questionnaire: Option<Questionnaire>,
    pub feedback: Option<Feedback>,
    pub trait_ratings: Vec<TraitRating>,
}

/// The request, provided `user` is the one asked to answer it.
fn assigned_request(db: &Database, user: &User, request_id: i64) -> AppResult<FeedbackRequest> {
    db.get_feedback_request(request_id)?
        .filter(|r| r.requested_to_id == user.id)
        .ok_or_else(|| AppError::NotFound(format!("feedback request #{}", request_id)))
}

pub async fn fill_form(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(request_id): Path<i64>,
) -> AppResult<Json<FillPage>> {
    let page = state.with_db(|db| {
        let request = assigned_request(db, &user, request_id)?;
        let questionnaire = match request.questionnaire_id {
            Some(id) => db.get_questionnaire(id)?,
            None => None,
        };
        let feedback = db.get_feedback_for_request(request.id)?;
        let trait_ratings = match &feedback {
            Some(f) => db.trait_ratings_for_feedback(f.id)?,
            None => vec![],
        };
        Ok(FillPage {
            request,
            questionnaire,
            feedback,
            trait_ratings,
        })
    })?;
    Ok(Json(page))
}

pub async fn submit_form(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(request_id): Path<i64>,
    Json(form): Json<NewFeedback>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let feedback_id = state.with_db(|db| {
        let request = assigned_request(db, &user, request_id)?;
        if request.status == RequestStatus::Completed {
            return Err(AppError::Conflict(format!(
                "feedback request #{} is already completed",
                request_id
            )));
        }
        form.validate().map_err(AppError::Validation)?;

        let allowed: BTreeSet<i64> = match request.questionnaire_id {
            Some(id) => db
                .get_questionnaire(id)?
                .map(|q| q.traits.iter().map(|t| t.id).collect::<BTreeSet<i64>>())
                .unwrap_or_default(),
            None => BTreeSet::new(),
        };
        if let Some(score) = form.trait_ratings.iter().find(|s| !allowed.contains(&s.trait_id)) {
            return Err(AppError::Validation(format!(
                "trait #{} is not part of this request's questionnaire",
                score.trait_id
            )));
        }

        Ok(db.submit_feedback(request.id, &form)?)
    })?;

    info!(request_id, feedback_id, author = user.id, "feedback submitted");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "request_id": request_id,
            "feedback_id": feedback_id,
            "status": RequestStatus::Completed,
        })),
    ))
}

// --- Dashboards ---

#[derive(Debug, Serialize)]
pub struct TeamMemberStats {
    pub id: i64,
    pub name: String,
    /// 0 when nothing has been received yet.
    pub avg_rating: f64,
    pub pending_requests: i64,
}

#[derive(Debug, Serialize)]
pub struct TeamPage {
    pub members: Vec<TeamMemberStats>,
    pub team_avg_rating: f64,
    pub pending_requests: i64,
}

pub async fn team(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<TeamPage>> {
    let page = state.with_db(|db| {
        let colleagues = db.list_colleagues(user.id)?;
        let mut members = Vec::with_capacity(colleagues.len());
        for colleague in &colleagues {
            members.push(TeamMemberStats {
                id: colleague.id,
                name: colleague.display_name(),
                avg_rating: db.average_rating_about(&[colleague.id])?.map_or(0.0, round1),
                pending_requests: db.pending_count_about(&[colleague.id])?,
            });
        }
        let ids: Vec<i64> = colleagues.iter().map(|u| u.id).collect();
        Ok(TeamPage {
            members,
            team_avg_rating: db.average_rating_about(&ids)?.map_or(0.0, round1),
            pending_requests: db.pending_count_about(&ids)?,
        })
    })?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
pub struct TasksPage {
    pub requested_by_me: Vec<FeedbackRequest>,
    pub assigned_to_me: Vec<FeedbackRequest>,
}

pub async fn tasks_dashboard(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<TasksPage>> {
    let page = state.with_db(|db| {
        Ok(TasksPage {
            requested_by_me: db.list_requests_made(user.id)?,
            assigned_to_me: db.list_requests_assigned(user.id, None)?,
        })
    })?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
pub struct ResultsPage {
    pub company_name: String,
    #[serde(flatten)]
    pub stats: UserStats,
}

pub async fn results(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<ResultsPage>> {
    let page = state.with_db(|db| {
        let company_name = db
            .get_profile(user.id)?
            .and_then(|p| p.company_name)
            .unwrap_or_default();
        let stats = FeedbackAnalytics::user_stats(db, user.id)?;
        Ok(ResultsPage {
            company_name,
            stats,
        })
    })?;
    Ok(Json(page))
}

// --- AI narrative ---

pub async fn generate_ai_feedback(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let input: GenerationInput = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON: {}", e)))?;

    let text = state.generator().generate(&input).await.map_err(|e| {
        warn!(user_id = user.id, "feedback generation failed: {:#}", e);
        AppError::Ai(format!("{:#}", e))
    })?;
    Ok(Json(json!({ "feedback": text })))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackDataQuery {
    pub user_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct FeedbackData {
    pub user_id: i64,
    pub feedback_count: usize,
    #[serde(flatten)]
    pub input: GenerationInput,
}

/// Averages and joined text about a user, shaped as a generation request.
pub async fn feedback_data(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<FeedbackDataQuery>,
) -> AppResult<Json<FeedbackData>> {
    let subject_id = query.user_id.unwrap_or(user.id);
    let data = state.with_db(|db| {
        let subject = db
            .get_user(subject_id)?
            .ok_or_else(|| AppError::NotFound(format!("user #{}", subject_id)))?;
        if !can_view_user(db, &user, subject_id)? {
            return Err(AppError::Forbidden);
        }
        let feedback = db.completed_feedback_about(subject_id)?;
        Ok(FeedbackData {
            user_id: subject_id,
            feedback_count: feedback.len(),
            input: GenerationInput {
                ratings: FeedbackAnalytics::average_ratings(&feedback),
                keywords: collect_keywords(feedback.iter().map(|f| f.keywords.as_str())).join(", "),
                comments: join_non_empty(feedback.iter().map(|f| f.comments.as_str()), "\n"),
                existing_feedback: join_non_empty(feedback.iter().map(|f| f.feedback.as_str()), "\n\n"),
                colleague_name: subject.display_name(),
            },
        })
    })?;
    Ok(Json(data))
}

fn join_non_empty<'a>(parts: impl Iterator<Item = &'a str>, sep: &str) -> String {
    parts
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(sep)
}

#[derive(Debug, Serialize)]
pub struct FeedbackList {
    pub scope: &'static str,
    pub feedback: Vec<FeedbackEntry>,
}

pub async fn all_feedback(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<FeedbackList>> {
    let list = state.with_db(|db| {
        let scope = visible_subjects(db, &user)?;
        Ok(FeedbackList {
            scope: scope_label(&scope, user.id),
            feedback: db.list_feedback_entries(&scope)?,
        })
    })?;
    Ok(Json(list))
}

#[derive(Debug, Serialize)]
pub struct DepartmentStats {
    pub department_id: i64,
    pub name: String,
    pub member_count: usize,
    pub feedback_count: usize,
    pub pending_requests: i64,
    pub averages: Ratings,
}

pub async fn department_stats(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(department_id): Path<i64>,
) -> AppResult<Json<DepartmentStats>> {
    let stats = state.with_db(|db| {
        let department = db
            .get_department(department_id)?
            .ok_or_else(|| AppError::NotFound(format!("department #{}", department_id)))?;

        let allowed = user.is_superuser
            || db
                .get_profile(user.id)?
                .is_some_and(|p| p.is_company_admin && p.company_id == Some(department.company_id))
            || manages_department(db, user.id, department.id)?;
        if !allowed {
            return Err(AppError::Forbidden);
        }

        let subtree = db.department_subtree_ids(department.id)?;
        let members = db.member_ids_of_departments(&subtree)?;
        let feedback = db.completed_feedback_about_any(&members)?;
        let averages = FeedbackAnalytics::average_ratings(&feedback);

        Ok(DepartmentStats {
            department_id: department.id,
            name: department.name,
            member_count: members.len(),
            feedback_count: feedback.len(),
            pending_requests: db.pending_count_about(&members)?,
            averages: Ratings {
                rating: averages.rating.map(round2),
                teamwork: averages.teamwork.map(round2),
                communication: averages.communication.map(round2),
                initiative: averages.initiative.map(round2),
                technical_skills: averages.technical_skills.map(round2),
                problem_solving: averages.problem_solving.map(round2),
            },
        })
    })?;
    Ok(Json(stats))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{json_body, login_as, send, state, state_with};
    use crate::ai::tests::StubProvider;
    use crate::db::ProfileUpdate;
    use axum::http::{header::LOCATION, Method, StatusCode};
    use serde_json::json;

    fn rating_body(rating: i64, text: &str) -> serde_json::Value {
        json!({
            "rating": rating,
            "teamwork_rating": rating,
            "communication_rating": rating,
            "initiative_rating": rating,
            "technical_skills_rating": rating,
            "problem_solving_rating": rating,
            "keywords": "Reliable, Calm",
            "comments": "Good sprint",
            "feedback": text
        })
    }

    async fn request(state: &super::AppState, token: &str, to: i64) -> i64 {
        let body = json!({"requested_to": to, "project_name": "Apollo", "due_date": "2026-11-01"});
        let response = send(state, Method::POST, "/request_feedback", Some(token), Some(body)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        json_body(response).await["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_request_fill_and_results() {
        let state = state();
        let (_, ana_token) = login_as(&state, "ana", false);
        let (ben, ben_token) = login_as(&state, "ben", false);

        let request_id = request(&state, &ana_token, ben).await;

        let response = send(&state, Method::GET, "/home", Some(&ben_token), None).await;
        let home = json_body(response).await;
        assert_eq!(home["pending_requests"][0]["id"], request_id);

        let uri = format!("/feedback/fill/{}", request_id);
        // Only the person asked may see or answer it
        let response = send(&state, Method::GET, &uri, Some(&ana_token), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&state, Method::POST, &uri, Some(&ben_token), Some(rating_body(8, "Strong lead"))).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = send(&state, Method::POST, &uri, Some(&ben_token), Some(rating_body(3, "Again"))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = send(&state, Method::GET, &uri, Some(&ben_token), None).await;
        let page = json_body(response).await;
        assert_eq!(page["request"]["status"], "completed");
        assert_eq!(page["feedback"]["rating"], 8);

        let response = send(&state, Method::GET, "/results", Some(&ana_token), None).await;
        let results = json_body(response).await;
        assert_eq!(results["received_feedback_count"], 1);
        assert_eq!(results["overall_avg_rating"], 8.0);
        assert_eq!(results["strengths"], json!(["Strong lead"]));
        assert_eq!(results["all_keywords"], json!(["Calm", "Reliable"]));
        assert_eq!(results["recommended_trainings"], json!([]));
    }

    #[tokio::test]
    async fn test_out_of_scale_rating_is_rejected() {
        let state = state();
        let (_, ana_token) = login_as(&state, "ana", false);
        let (ben, ben_token) = login_as(&state, "ben", false);
        let request_id = request(&state, &ana_token, ben).await;

        let uri = format!("/feedback/fill/{}", request_id);
        let response = send(&state, Method::POST, &uri, Some(&ben_token), Some(rating_body(11, "x"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&state, Method::GET, &uri, Some(&ben_token), None).await;
        assert_eq!(json_body(response).await["request"]["status"], "pending");
    }

    #[tokio::test]
    async fn test_team_without_feedback_reports_zero() {
        let state = state();
        let (_, ana_token) = login_as(&state, "ana", false);
        login_as(&state, "ben", false);

        let response = send(&state, Method::GET, "/team", Some(&ana_token), None).await;
        let team = json_body(response).await;
        assert_eq!(team["members"][0]["avg_rating"], 0.0);
        assert_eq!(team["team_avg_rating"], 0.0);
    }

    async fn questionnaire_with_trait(state: &super::AppState, token: &str) -> (i64, i64) {
        let response = send(state, Method::POST, "/traits", Some(token), Some(json!({"name": "Calm"}))).await;
        let trait_id = json_body(response).await["id"].as_i64().unwrap();
        let body = json!({"title": "Review", "trait_ids": [trait_id]});
        let response = send(state, Method::POST, "/questionnaires", Some(token), Some(body)).await;
        (json_body(response).await["id"].as_i64().unwrap(), trait_id)
    }

    #[tokio::test]
    async fn test_repeated_trait_rating_is_rejected() {
        let state = state();
        let (_, ana_token) = login_as(&state, "ana", false);
        let (ben, ben_token) = login_as(&state, "ben", false);
        let (questionnaire, calm) = questionnaire_with_trait(&state, &ana_token).await;

        let body = json!({
            "requested_to": ben, "project_name": "Apollo",
            "due_date": "2026-12-01", "questionnaire_id": questionnaire
        });
        let response = send(&state, Method::POST, "/request_feedback", Some(&ana_token), Some(body)).await;
        let request_id = json_body(response).await["id"].as_i64().unwrap();

        let uri = format!("/feedback/fill/{}", request_id);
        let body = json!({
            "rating": 7, "feedback": "ok",
            "trait_ratings": [{"trait_id": calm, "rating": 5}, {"trait_id": calm, "rating": 9}]
        });
        let response = send(&state, Method::POST, &uri, Some(&ben_token), Some(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&state, Method::GET, &uri, Some(&ben_token), None).await;
        assert_eq!(json_body(response).await["request"]["status"], "pending");
    }

    #[tokio::test]
    async fn test_request_with_someone_elses_questionnaire() {
        let state = state();
        let (ana, ana_token) = login_as(&state, "ana", false);
        let (ben, ben_token) = login_as(&state, "ben", false);
        let (_, root_token) = login_as(&state, "root", true);
        let (questionnaire, _) = questionnaire_with_trait(&state, &ana_token).await;

        let body = json!({
            "requested_to": ana, "project_name": "Apollo",
            "due_date": "2026-12-01", "questionnaire_id": questionnaire
        });
        let response = send(&state, Method::POST, "/request_feedback", Some(&ben_token), Some(body)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = json!({
            "requested_to": ben, "project_name": "Apollo",
            "due_date": "2026-12-01", "questionnaire_id": questionnaire
        });
        let response = send(&state, Method::POST, "/request_feedback", Some(&root_token), Some(body)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_request_for_unknown_user() {
        let state = state();
        let (_, token) = login_as(&state, "ana", false);
        let body = json!({"requested_to": 999, "project_name": "Apollo", "due_date": "2026-11-01"});
        let response = send(&state, Method::POST, "/request_feedback", Some(&token), Some(body)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_send_feedback_is_about_the_target() {
        let state = state();
        let (ana, ana_token) = login_as(&state, "ana", false);
        let (_, ben_token) = login_as(&state, "ben", false);

        let uri = format!("/send_feedback/{}", ana);
        let response = send(&state, Method::POST, &uri, Some(&ben_token), Some(rating_body(6, "Keep going"))).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = send(&state, Method::GET, "/results", Some(&ana_token), None).await;
        let results = json_body(response).await;
        assert_eq!(results["received_feedback_count"], 1);
        assert_eq!(results["recommended_trainings"].as_array().unwrap().len(), 5);

        let response = send(&state, Method::POST, &uri, Some(&ana_token), Some(rating_body(6, "me"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_team_rollup() {
        let state = state();
        let (ana, ana_token) = login_as(&state, "ana", false);
        let (ben, _) = login_as(&state, "ben", false);
        let (cid, cid_token) = login_as(&state, "cid", false);

        let uri = format!("/send_feedback/{}", ben);
        for (token, rating) in [(&ana_token, 7), (&cid_token, 8)] {
            let response = send(&state, Method::POST, &uri, Some(token.as_str()), Some(rating_body(rating, "x"))).await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }
        // Still pending, about cid
        request(&state, &cid_token, ana).await;

        let response = send(&state, Method::GET, "/team", Some(&ana_token), None).await;
        let team = json_body(response).await;
        let members = team["members"].as_array().unwrap();
        assert_eq!(members.len(), 2);
        let ben_row = members.iter().find(|m| m["id"] == ben).unwrap();
        assert_eq!(ben_row["avg_rating"], 7.5);
        let cid_row = members.iter().find(|m| m["id"] == cid).unwrap();
        assert_eq!(cid_row["avg_rating"], 0.0);
        assert_eq!(cid_row["pending_requests"], 1);
        assert_eq!(team["team_avg_rating"], 7.5);
    }

    #[tokio::test]
    async fn test_tasks_dashboard() {
        let state = state();
        let (ana, ana_token) = login_as(&state, "ana", false);
        let (ben, ben_token) = login_as(&state, "ben", false);
        request(&state, &ana_token, ben).await;
        request(&state, &ben_token, ana).await;

        let response = send(&state, Method::GET, "/tasks/dashboard", Some(&ana_token), None).await;
        let tasks = json_body(response).await;
        assert_eq!(tasks["requested_by_me"].as_array().unwrap().len(), 1);
        assert_eq!(tasks["assigned_to_me"][0]["requester_name"], "Ben Tester");
    }

    #[tokio::test]
    async fn test_generate_ai_feedback() {
        let state = state();
        let (_, token) = login_as(&state, "ana", false);

        let body = json!({"colleague_name": "Ben", "ratings": {"rating": 8.5}, "keywords": "Calm"});
        let response = send(&state, Method::POST, "/generate_ai_feedback", Some(&token), Some(body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"feedback": "Generated narrative"}));
    }

    #[tokio::test]
    async fn test_generate_ai_feedback_errors() {
        let state = state_with(StubProvider::failing("upstream quota exceeded"));
        let (_, token) = login_as(&state, "ana", false);

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/generate_ai_feedback")
            .header("authorization", format!("Bearer {}", token))
            .body(axum::body::Body::from("{not json"))
            .unwrap();
        let response = tower::ServiceExt::oneshot(super::super::build_router(state.clone()), request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json!({"colleague_name": "Ben"});
        let response = send(&state, Method::POST, "/generate_ai_feedback", Some(&token), Some(body)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let error = json_body(response).await;
        assert!(error["error"].as_str().unwrap().contains("upstream quota exceeded"));
    }

    #[tokio::test]
    async fn test_all_feedback_visibility() {
        let state = state();
        let (ana, ana_token) = login_as(&state, "ana", false);
        let (ben, ben_token) = login_as(&state, "ben", false);
        let (_, root_token) = login_as(&state, "root", true);

        send(&state, Method::POST, &format!("/send_feedback/{}", ben), Some(&ana_token), Some(rating_body(5, "to ben"))).await;
        send(&state, Method::POST, &format!("/send_feedback/{}", ana), Some(&ben_token), Some(rating_body(9, "to ana"))).await;

        let response = send(&state, Method::GET, "/all_feedback", Some(&ana_token), None).await;
        let own = json_body(response).await;
        assert_eq!(own["scope"], "own");
        assert_eq!(own["feedback"].as_array().unwrap().len(), 1);
        assert_eq!(own["feedback"][0]["feedback"], "to ana");

        let response = send(&state, Method::GET, "/all_feedback", Some(&root_token), None).await;
        let all = json_body(response).await;
        assert_eq!(all["scope"], "all");
        assert_eq!(all["feedback"].as_array().unwrap().len(), 2);

        // Managing ben widens ana's view
        state
            .with_db(|db| {
                db.update_profile(ben, &ProfileUpdate { manager_id: Some(Some(ana)), ..Default::default() })?;
                Ok(())
            })
            .unwrap();
        let response = send(&state, Method::GET, "/all_feedback", Some(&ana_token), None).await;
        let team = json_body(response).await;
        assert_eq!(team["scope"], "team");
        assert_eq!(team["feedback"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_feedback_data_permissions() {
        let state = state();
        let (ana, ana_token) = login_as(&state, "ana", false);
        let (_, ben_token) = login_as(&state, "ben", false);
        send(&state, Method::POST, &format!("/send_feedback/{}", ana), Some(&ben_token), Some(rating_body(6, "Solid"))).await;
        send(&state, Method::POST, &format!("/send_feedback/{}", ana), Some(&ben_token), Some(rating_body(9, "Great"))).await;

        let response = send(&state, Method::GET, "/get_feedback_data", Some(&ana_token), None).await;
        let data = json_body(response).await;
        assert_eq!(data["user_id"], ana);
        assert_eq!(data["feedback_count"], 2);
        assert_eq!(data["colleague_name"], "Ana Tester");
        assert_eq!(data["ratings"]["rating"], 7.5);
        assert_eq!(data["keywords"], "Calm, Reliable");
        assert_eq!(data["existing_feedback"], "Solid\n\nGreat");

        let uri = format!("/get_feedback_data?user_id={}", ana);
        let response = send(&state, Method::GET, &uri, Some(&ben_token), None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[LOCATION], "/home");
    }

    #[tokio::test]
    async fn test_department_stats_for_manager() {
        let state = state();
        let (ana, ana_token) = login_as(&state, "ana", false);
        let (ben, ben_token) = login_as(&state, "ben", false);
        let (cid, cid_token) = login_as(&state, "cid", false);

        let (root, child) = state
            .with_db(|db| {
                let acme = db.create_company("Acme")?;
                let root = db.create_department(acme, "Engineering", None, Some(ana))?;
                let child = db.create_department(acme, "Platform", Some(root), None)?;
                for (user, dept) in [(ben, child), (cid, root)] {
                    db.update_profile(
                        user,
                        &ProfileUpdate {
                            company_id: Some(Some(acme)),
                            department_id: Some(Some(dept)),
                            ..Default::default()
                        },
                    )?;
                }
                Ok((root, child))
            })
            .unwrap();

        send(&state, Method::POST, &format!("/send_feedback/{}", ben), Some(&cid_token), Some(rating_body(4, "a"))).await;
        send(&state, Method::POST, &format!("/send_feedback/{}", cid), Some(&ben_token), Some(rating_body(7, "b"))).await;

        let response = send(&state, Method::GET, &format!("/departments/{}/stats", root), Some(&ana_token), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let stats = json_body(response).await;
        assert_eq!(stats["member_count"], 2);
        assert_eq!(stats["feedback_count"], 2);
        assert_eq!(stats["averages"]["rating"], 5.5);

        let response = send(&state, Method::GET, &format!("/departments/{}/stats", child), Some(&ben_token), None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
    }
}
