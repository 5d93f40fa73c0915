use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::info;

use super::AppState;
use crate::auth::CurrentUser;
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::models::{Questionnaire, Trait, User};

#[derive(Debug, Deserialize)]
pub struct QuestionnaireForm {
    pub title: String,
    #[serde(default)]
    pub trait_ids: Vec<i64>,
}

impl QuestionnaireForm {
    fn checked(&self, db: &Database) -> AppResult<(&str, Vec<i64>)> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(AppError::Validation("title is required".into()));
        }
        let known: BTreeSet<i64> = db.list_traits()?.iter().map(|t| t.id).collect();
        if let Some(unknown) = self.trait_ids.iter().find(|id| !known.contains(id)) {
            return Err(AppError::Validation(format!("unknown trait #{}", unknown)));
        }
        // Keep first occurrence order, drop repeats
        let mut seen = BTreeSet::new();
        let trait_ids = self
            .trait_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();
        Ok((title, trait_ids))
    }
}

/// Owners and superusers see a questionnaire; everyone else gets a 404.
fn owned_questionnaire(db: &Database, user: &User, id: i64) -> AppResult<Questionnaire> {
    db.get_questionnaire(id)?
        .filter(|q| user.is_superuser || q.created_by == user.id)
        .ok_or_else(|| AppError::NotFound(format!("questionnaire #{}", id)))
}

pub async fn list(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<Vec<Questionnaire>>> {
    let questionnaires = state.with_db(|db| Ok(db.list_questionnaires(Some(user.id))?))?;
    Ok(Json(questionnaires))
}

pub async fn create(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(form): Json<QuestionnaireForm>,
) -> AppResult<(StatusCode, Json<Questionnaire>)> {
    let questionnaire = state.with_db(|db| {
        let (title, trait_ids) = form.checked(db)?;
        let id = db.create_questionnaire(title, user.id, &trait_ids)?;
        owned_questionnaire(db, &user, id)
    })?;
    info!(questionnaire_id = questionnaire.id, "questionnaire created");
    Ok((StatusCode::CREATED, Json(questionnaire)))
}

pub async fn show(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Questionnaire>> {
    let questionnaire = state.with_db(|db| owned_questionnaire(db, &user, id))?;
    Ok(Json(questionnaire))
}

pub async fn update(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(form): Json<QuestionnaireForm>,
) -> AppResult<Json<Questionnaire>> {
    let questionnaire = state.with_db(|db| {
        owned_questionnaire(db, &user, id)?;
        let (title, trait_ids) = form.checked(db)?;
        db.update_questionnaire(id, title, &trait_ids)?;
        owned_questionnaire(db, &user, id)
    })?;
    Ok(Json(questionnaire))
}

pub async fn remove(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    state.with_db(|db| {
        owned_questionnaire(db, &user, id)?;
        db.delete_questionnaire(id)?;
        Ok(())
    })?;
    info!(questionnaire_id = id, "questionnaire deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_traits(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
) -> AppResult<Json<Vec<Trait>>> {
    let traits = state.with_db(|db| Ok(db.list_traits()?))?;
    Ok(Json(traits))
}

#[derive(Debug, Deserialize)]
pub struct TraitForm {
    pub name: String,
}

pub async fn create_trait(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
    Json(form): Json<TraitForm>,
) -> AppResult<(StatusCode, Json<Trait>)> {
    let name = form.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::Validation("name is required".into()));
    }
    let created = state.with_db(|db| {
        if db.list_traits()?.iter().any(|t| t.name == name) {
            return Err(AppError::Conflict(format!("trait '{}' already exists", name)));
        }
        let id = db.create_trait(&name)?;
        Ok(Trait { id, name })
    })?;
    Ok((StatusCode::CREATED, Json(created)))
}
