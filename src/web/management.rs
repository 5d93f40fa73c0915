use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

use super::AppState;
use crate::auth::SuperUser;
use crate::db::{DepartmentUpdate, ProfileUpdate};
use crate::error::{AppError, AppResult};
use crate::models::{Company, Department, DepartmentTree, Employee, Profile};

/// Distinguishes a missing field (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn invalid(e: anyhow::Error) -> AppError {
    AppError::Validation(format!("{:#}", e))
}

#[derive(Debug, Serialize)]
pub struct CompanyOverview {
    #[serde(flatten)]
    pub company: Company,
    pub departments: Vec<DepartmentTree>,
    pub employees: Vec<Employee>,
}

#[derive(Debug, Serialize)]
pub struct ManagementPage {
    pub companies: Vec<CompanyOverview>,
    pub unassigned: Vec<Employee>,
}

pub async fn overview(
    State(state): State<AppState>,
    SuperUser(_): SuperUser,
) -> AppResult<Json<ManagementPage>> {
    let page = state.with_db(|db| {
        let mut companies = Vec::new();
        for company in db.list_companies()? {
            companies.push(CompanyOverview {
                departments: db.department_tree(company.id)?,
                employees: db.list_employees(Some(company.id))?,
                company,
            });
        }
        let unassigned = db
            .list_employees(None)?
            .into_iter()
            .filter(|e| e.profile.as_ref().and_then(|p| p.company_id).is_none())
            .collect();
        Ok(ManagementPage {
            companies,
            unassigned,
        })
    })?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct CompanyForm {
    pub name: String,
}

pub async fn create_company(
    State(state): State<AppState>,
    SuperUser(admin): SuperUser,
    Json(form): Json<CompanyForm>,
) -> AppResult<(StatusCode, Json<Company>)> {
    let name = form.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("name is required".into()));
    }
    let company = state.with_db(|db| {
        if db
            .list_companies()?
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(name))
        {
            return Err(AppError::Conflict(format!("company '{}' already exists", name)));
        }
        let id = db.create_company(name)?;
        db.get_company(id)?
            .ok_or_else(|| AppError::Internal("new company vanished".into()))
    })?;
    info!(company_id = company.id, by = admin.id, "company created");
    Ok((StatusCode::CREATED, Json(company)))
}

pub async fn delete_company(
    State(state): State<AppState>,
    SuperUser(admin): SuperUser,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    let deleted = state.with_db(|db| Ok(db.delete_company(id)?))?;
    if !deleted {
        return Err(AppError::NotFound(format!("company #{}", id)));
    }
    info!(company_id = id, by = admin.id, "company deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DepartmentForm {
    pub company_id: i64,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub manager_id: Option<i64>,
}

pub async fn create_department(
    State(state): State<AppState>,
    SuperUser(_): SuperUser,
    Json(form): Json<DepartmentForm>,
) -> AppResult<(StatusCode, Json<Department>)> {
    let name = form.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("name is required".into()));
    }
    let department = state.with_db(|db| {
        if db.get_company(form.company_id)?.is_none() {
            return Err(AppError::NotFound(format!("company #{}", form.company_id)));
        }
        if let Some(manager_id) = form.manager_id {
            if db.get_user(manager_id)?.is_none() {
                return Err(AppError::NotFound(format!("user #{}", manager_id)));
            }
        }
        let id = db
            .create_department(form.company_id, name, form.parent_id, form.manager_id)
            .map_err(invalid)?;
        db.get_department(id)?
            .ok_or_else(|| AppError::Internal("new department vanished".into()))
    })?;
    info!(department_id = department.id, "department created");
    Ok((StatusCode::CREATED, Json(department)))
}

#[derive(Debug, Deserialize, Default)]
pub struct DepartmentPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub parent_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub manager_id: Option<Option<i64>>,
}

pub async fn update_department(
    State(state): State<AppState>,
    SuperUser(_): SuperUser,
    Path(id): Path<i64>,
    Json(patch): Json<DepartmentPatch>,
) -> AppResult<Json<Department>> {
    if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(AppError::Validation("name cannot be empty".into()));
    }
    let department = state.with_db(|db| {
        if db.get_department(id)?.is_none() {
            return Err(AppError::NotFound(format!("department #{}", id)));
        }
        let update = DepartmentUpdate {
            name: patch.name.as_deref().map(|n| n.trim().to_string()),
            parent_id: patch.parent_id,
            manager_id: patch.manager_id,
        };
        db.update_department(id, &update).map_err(invalid)?;
        db.get_department(id)?
            .ok_or_else(|| AppError::NotFound(format!("department #{}", id)))
    })?;
    Ok(Json(department))
}

pub async fn delete_department(
    State(state): State<AppState>,
    SuperUser(_): SuperUser,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    let deleted = state.with_db(|db| Ok(db.delete_department(id)?))?;
    if !deleted {
        return Err(AppError::NotFound(format!("department #{}", id)));
    }
    info!(department_id = id, "department deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Default)]
pub struct EmployeePatch {
    #[serde(default, deserialize_with = "double_option")]
    pub company_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub department_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub manager_id: Option<Option<i64>>,
    #[serde(default)]
    pub is_company_admin: Option<bool>,
}

pub async fn update_employee(
    State(state): State<AppState>,
    SuperUser(admin): SuperUser,
    Path(user_id): Path<i64>,
    Json(patch): Json<EmployeePatch>,
) -> AppResult<Json<Profile>> {
    let profile = state.with_db(|db| {
        if db.get_user(user_id)?.is_none() {
            return Err(AppError::NotFound(format!("user #{}", user_id)));
        }
        if let Some(Some(company_id)) = patch.company_id {
            if db.get_company(company_id)?.is_none() {
                return Err(AppError::NotFound(format!("company #{}", company_id)));
            }
        }
        if let Some(Some(manager_id)) = patch.manager_id {
            if db.get_user(manager_id)?.is_none() {
                return Err(AppError::NotFound(format!("user #{}", manager_id)));
            }
        }
        let update = ProfileUpdate {
            company_id: patch.company_id,
            department_id: patch.department_id,
            manager_id: patch.manager_id,
            is_company_admin: patch.is_company_admin,
        };
        db.update_profile(user_id, &update).map_err(invalid)
    })?;
    info!(user_id, by = admin.id, "employee updated");
    Ok(Json(profile))
}
