use anyhow::{anyhow, bail, Context, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::PathBuf;
use tracing::debug;

use crate::models::{
    Company, Department, DepartmentTree, Employee, Feedback, FeedbackEntry, FeedbackRequest,
    NewFeedback, Profile, Questionnaire, RequestStatus, Trait, TraitRating, User,
};

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

/// Fields needed to create a user account.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
    pub is_superuser: bool,
}

#[derive(Debug, Clone)]
pub struct NewFeedbackRequest {
    pub requester_id: i64,
    pub requested_to_id: i64,
    pub project_name: String,
    pub comment: Option<String>,
    pub due_date: chrono::NaiveDate,
    pub questionnaire_id: Option<i64>,
}

/// Partial update of a department. `None` leaves a field untouched;
/// `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default)]
pub struct DepartmentUpdate {
    pub name: Option<String>,
    pub parent_id: Option<Option<i64>>,
    pub manager_id: Option<Option<i64>>,
}

/// Self-service account fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

/// Partial update of a profile, same convention as [`DepartmentUpdate`].
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub company_id: Option<Option<i64>>,
    pub department_id: Option<Option<i64>>,
    pub manager_id: Option<Option<i64>>,
    pub is_company_admin: Option<bool>,
}

/// Which completed feedback a listing covers.
#[derive(Debug, Clone)]
pub enum FeedbackScope {
    All,
    Company(i64),
    Subjects(Vec<i64>),
}

impl ToSql for RequestStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RequestStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        RequestStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown request status '{}'", s).into()))
    }
}

const USER_COLUMNS: &str =
    "u.id, u.username, u.email, u.first_name, u.last_name, u.password_hash, u.is_superuser, u.date_joined";

const PROFILE_SELECT: &str = "SELECT p.id, p.user_id, p.company_id, c.name, p.department_id, p.manager_id, p.is_company_admin
     FROM profiles p
     LEFT JOIN companies c ON p.company_id = c.id";

const REQUEST_SELECT: &str = "SELECT r.id, r.requester_id,
            COALESCE(NULLIF(TRIM(a.first_name || ' ' || a.last_name), ''), a.username),
            r.requested_to_id,
            COALESCE(NULLIF(TRIM(b.first_name || ' ' || b.last_name), ''), b.username),
            r.project_name, r.comment, r.due_date, r.status, r.questionnaire_id, r.created_at
     FROM feedback_requests r
     JOIN users a ON r.requester_id = a.id
     JOIN users b ON r.requested_to_id = b.id";

const FEEDBACK_COLUMNS: &str = "f.id, f.feedback_request_id, f.rating, f.teamwork_rating, f.communication_rating,
            f.initiative_rating, f.technical_skills_rating, f.problem_solving_rating,
            f.keywords, f.comments, f.feedback, f.created_at";

impl Database {
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => Self::default_path()?,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn, path })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "feedbackas") {
            Ok(proj_dirs.data_dir().join("feedbackas.db"))
        } else {
            Ok(PathBuf::from("feedbackas.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL DEFAULT '',
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                password_hash TEXT NOT NULL,
                is_superuser INTEGER NOT NULL DEFAULT 0,
                date_joined TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS companies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS departments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id INTEGER NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                parent_id INTEGER REFERENCES departments(id) ON DELETE CASCADE,
                manager_id INTEGER REFERENCES users(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
                company_id INTEGER REFERENCES companies(id) ON DELETE SET NULL,
                department_id INTEGER REFERENCES departments(id) ON DELETE SET NULL,
                manager_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
                is_company_admin INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS traits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS questionnaires (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                created_by INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS questionnaire_traits (
                questionnaire_id INTEGER NOT NULL REFERENCES questionnaires(id) ON DELETE CASCADE,
                trait_id INTEGER NOT NULL REFERENCES traits(id) ON DELETE CASCADE,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (questionnaire_id, trait_id)
            );

            CREATE TABLE IF NOT EXISTS feedback_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                requester_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                requested_to_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                project_name TEXT NOT NULL,
                comment TEXT,
                due_date TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'completed')),
                questionnaire_id INTEGER REFERENCES questionnaires(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feedback_request_id INTEGER NOT NULL UNIQUE REFERENCES feedback_requests(id) ON DELETE CASCADE,
                rating INTEGER NOT NULL,
                teamwork_rating INTEGER NOT NULL DEFAULT 5,
                communication_rating INTEGER NOT NULL DEFAULT 5,
                initiative_rating INTEGER NOT NULL DEFAULT 5,
                technical_skills_rating INTEGER NOT NULL DEFAULT 5,
                problem_solving_rating INTEGER NOT NULL DEFAULT 5,
                keywords TEXT NOT NULL DEFAULT '',
                comments TEXT NOT NULL DEFAULT '',
                feedback TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS trait_ratings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feedback_id INTEGER NOT NULL REFERENCES feedback(id) ON DELETE CASCADE,
                trait_id INTEGER NOT NULL REFERENCES traits(id) ON DELETE CASCADE,
                rating INTEGER NOT NULL,
                UNIQUE (feedback_id, trait_id)
            );

            CREATE TRIGGER IF NOT EXISTS feedback_requests_status_forward
            BEFORE UPDATE OF status ON feedback_requests
            WHEN OLD.status = 'completed' AND NEW.status <> 'completed'
            BEGIN
                SELECT RAISE(ABORT, 'completed feedback requests cannot be reopened');
            END;

            CREATE INDEX IF NOT EXISTS idx_profiles_company ON profiles(company_id);
            CREATE INDEX IF NOT EXISTS idx_profiles_department ON profiles(department_id);
            CREATE INDEX IF NOT EXISTS idx_departments_company ON departments(company_id);
            CREATE INDEX IF NOT EXISTS idx_requests_requester ON feedback_requests(requester_id, status);
            CREATE INDEX IF NOT EXISTS idx_requests_requested_to ON feedback_requests(requested_to_id, status);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='feedback_requests'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!(
                "Database not initialized. Run 'feedbackas init' first."
            ));
        }
        Ok(())
    }

    // --- User operations ---

    pub fn create_user(&self, user: &NewUser) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO users (username, email, first_name, last_name, password_hash, is_superuser)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.username,
                    user.email,
                    user.first_name,
                    user.last_name,
                    user.password_hash,
                    user.is_superuser
                ],
            )
            .with_context(|| format!("Failed to create user '{}'", user.username))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_user(&self, id: i64, update: &UserUpdate) -> Result<User> {
        let current = self
            .get_user(id)?
            .ok_or_else(|| anyhow!("User #{} not found", id))?;
        let first_name = update.first_name.as_ref().unwrap_or(&current.first_name);
        let last_name = update.last_name.as_ref().unwrap_or(&current.last_name);
        let email = update.email.as_ref().unwrap_or(&current.email);
        self.conn
            .execute(
                "UPDATE users SET first_name = ?1, last_name = ?2, email = ?3 WHERE id = ?4",
                params![first_name, last_name, email, id],
            )
            .with_context(|| format!("Failed to update user #{}", id))?;
        self.get_user(id)?
            .ok_or_else(|| anyhow!("User #{} vanished", id))
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM users u WHERE u.id = ?1", USER_COLUMNS),
                [id],
                Self::row_to_user,
            )
            .optional()
            .context("Failed to load user")
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM users u WHERE u.username = ?1", USER_COLUMNS),
                [username],
                Self::row_to_user,
            )
            .optional()
            .context("Failed to load user")
    }

    /// Emails are not unique, so every match is returned.
    pub fn find_users_by_email(&self, email: &str) -> Result<Vec<User>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM users u WHERE LOWER(u.email) = LOWER(?1) ORDER BY u.id",
            USER_COLUMNS
        ))?;
        let rows = stmt.query_map([email], Self::row_to_user)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to look up users by email")
    }

    pub fn username_taken(&self, username: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM users WHERE LOWER(username) = LOWER(?1)",
            [username],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Colleagues of `user_id`: everyone in the same company, or every other
    /// user when there is no profile or no company link.
    pub fn list_colleagues(&self, user_id: i64) -> Result<Vec<User>> {
        let company_id = self.get_profile(user_id)?.and_then(|p| p.company_id);

        let rows = match company_id {
            Some(company_id) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM users u
                     JOIN profiles p ON p.user_id = u.id
                     WHERE p.company_id = ?1 AND u.id <> ?2
                     ORDER BY u.last_name, u.first_name, u.id",
                    USER_COLUMNS
                ))?;
                let rows = stmt.query_map(params![company_id, user_id], Self::row_to_user)?;
                rows.collect::<Result<Vec<_>, _>>()
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM users u WHERE u.id <> ?1
                     ORDER BY u.last_name, u.first_name, u.id",
                    USER_COLUMNS
                ))?;
                let rows = stmt.query_map([user_id], Self::row_to_user)?;
                rows.collect::<Result<Vec<_>, _>>()
            }
        };
        rows.context("Failed to list colleagues")
    }

    pub fn list_employees(&self, company_id: Option<i64>) -> Result<Vec<Employee>> {
        let mut sql = format!(
            "SELECT {}, p.id, p.user_id, p.company_id, c.name, p.department_id, p.manager_id, p.is_company_admin
             FROM users u
             LEFT JOIN profiles p ON p.user_id = u.id
             LEFT JOIN companies c ON p.company_id = c.id",
            USER_COLUMNS
        );
        if company_id.is_some() {
            sql.push_str(" WHERE p.company_id = ?1");
        }
        sql.push_str(" ORDER BY u.last_name, u.first_name, u.id");

        let map = |row: &rusqlite::Row| -> rusqlite::Result<Employee> {
            let user = Self::row_to_user(row)?;
            let profile_id: Option<i64> = row.get(8)?;
            let profile = match profile_id {
                Some(id) => Some(Profile {
                    id,
                    user_id: row.get(9)?,
                    company_id: row.get(10)?,
                    company_name: row.get(11)?,
                    department_id: row.get(12)?,
                    manager_id: row.get(13)?,
                    is_company_admin: row.get(14)?,
                }),
                None => None,
            };
            Ok(Employee { user, profile })
        };

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = match company_id {
            Some(id) => stmt.query_map([id], map)?,
            None => stmt.query_map([], map)?,
        };
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list employees")
    }

    fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            first_name: row.get(3)?,
            last_name: row.get(4)?,
            password_hash: row.get(5)?,
            is_superuser: row.get(6)?,
            date_joined: row.get(7)?,
        })
    }

    // --- Session operations ---

    pub fn create_session(&self, user_id: i64, token: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (token, user_id) VALUES (?1, ?2)",
            params![token, user_id],
        )?;
        Ok(())
    }

    pub fn user_for_session(&self, token: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM sessions s JOIN users u ON s.user_id = u.id WHERE s.token = ?1",
                    USER_COLUMNS
                ),
                [token],
                Self::row_to_user,
            )
            .optional()
            .context("Failed to resolve session")
    }

    pub fn delete_session(&self, token: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sessions WHERE token = ?1", [token])?;
        Ok(())
    }

    // --- Company operations ---

    pub fn create_company(&self, name: &str) -> Result<i64> {
        self.conn
            .execute("INSERT INTO companies (name) VALUES (?1)", [name])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_or_create_company(&self, name: &str) -> Result<i64> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM companies WHERE LOWER(name) = LOWER(?1) ORDER BY id LIMIT 1",
                [name],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok(id);
        }
        self.create_company(name)
    }

    pub fn get_company(&self, id: i64) -> Result<Option<Company>> {
        self.conn
            .query_row(
                "SELECT id, name, created_at FROM companies WHERE id = ?1",
                [id],
                Self::row_to_company,
            )
            .optional()
            .context("Failed to load company")
    }

    pub fn list_companies(&self) -> Result<Vec<Company>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, created_at FROM companies ORDER BY name, id")?;
        let rows = stmt.query_map([], Self::row_to_company)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list companies")
    }

    pub fn delete_company(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM companies WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    fn row_to_company(row: &rusqlite::Row) -> rusqlite::Result<Company> {
        Ok(Company {
            id: row.get(0)?,
            name: row.get(1)?,
            created_at: row.get(2)?,
        })
    }

    // --- Department operations ---

    pub fn create_department(
        &self,
        company_id: i64,
        name: &str,
        parent_id: Option<i64>,
        manager_id: Option<i64>,
    ) -> Result<i64> {
        if let Some(parent_id) = parent_id {
            let parent = self
                .get_department(parent_id)?
                .ok_or_else(|| anyhow!("Parent department #{} not found", parent_id))?;
            if parent.company_id != company_id {
                bail!("Parent department belongs to a different company");
            }
        }
        self.conn.execute(
            "INSERT INTO departments (company_id, name, parent_id, manager_id) VALUES (?1, ?2, ?3, ?4)",
            params![company_id, name, parent_id, manager_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_department(&self, id: i64) -> Result<Option<Department>> {
        self.conn
            .query_row(
                "SELECT id, company_id, name, parent_id, manager_id FROM departments WHERE id = ?1",
                [id],
                Self::row_to_department,
            )
            .optional()
            .context("Failed to load department")
    }

    pub fn list_departments(&self, company_id: i64) -> Result<Vec<Department>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, company_id, name, parent_id, manager_id FROM departments
             WHERE company_id = ?1 ORDER BY name, id",
        )?;
        let rows = stmt.query_map([company_id], Self::row_to_department)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list departments")
    }

    pub fn department_tree(&self, company_id: i64) -> Result<Vec<DepartmentTree>> {
        let departments = self.list_departments(company_id)?;
        Ok(build_tree(&departments, None))
    }

    /// Ids of the department and everything below it.
    pub fn department_subtree_ids(&self, id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "WITH RECURSIVE sub(id) AS (
                SELECT id FROM departments WHERE id = ?1
                UNION
                SELECT d.id FROM departments d JOIN sub ON d.parent_id = sub.id
             )
             SELECT id FROM sub",
        )?;
        let rows = stmt.query_map([id], |row| row.get(0))?;
        rows.collect::<Result<Vec<i64>, _>>()
            .context("Failed to walk department subtree")
    }

    /// Ids of the department and every department above it.
    pub fn department_ancestor_ids(&self, id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "WITH RECURSIVE up(id, parent_id) AS (
                SELECT id, parent_id FROM departments WHERE id = ?1
                UNION
                SELECT d.id, d.parent_id FROM departments d JOIN up ON d.id = up.parent_id
             )
             SELECT id FROM up",
        )?;
        let rows = stmt.query_map([id], |row| row.get(0))?;
        rows.collect::<Result<Vec<i64>, _>>()
            .context("Failed to walk department ancestors")
    }

    pub fn departments_managed_by(&self, user_id: i64) -> Result<Vec<Department>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, company_id, name, parent_id, manager_id FROM departments
             WHERE manager_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([user_id], Self::row_to_department)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list managed departments")
    }

    pub fn update_department(&self, id: i64, update: &DepartmentUpdate) -> Result<()> {
        let current = self
            .get_department(id)?
            .ok_or_else(|| anyhow!("Department #{} not found", id))?;

        let name = update.name.clone().unwrap_or(current.name);
        let parent_id = update.parent_id.unwrap_or(current.parent_id);
        let manager_id = update.manager_id.unwrap_or(current.manager_id);

        if let Some(parent_id) = parent_id {
            if self.department_subtree_ids(id)?.contains(&parent_id) {
                bail!("Department cannot be moved under itself or its own sub-department");
            }
            let parent = self
                .get_department(parent_id)?
                .ok_or_else(|| anyhow!("Parent department #{} not found", parent_id))?;
            if parent.company_id != current.company_id {
                bail!("Parent department belongs to a different company");
            }
        }

        self.conn.execute(
            "UPDATE departments SET name = ?1, parent_id = ?2, manager_id = ?3 WHERE id = ?4",
            params![name, parent_id, manager_id, id],
        )?;
        Ok(())
    }

    pub fn delete_department(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM departments WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    fn row_to_department(row: &rusqlite::Row) -> rusqlite::Result<Department> {
        Ok(Department {
            id: row.get(0)?,
            company_id: row.get(1)?,
            name: row.get(2)?,
            parent_id: row.get(3)?,
            manager_id: row.get(4)?,
        })
    }

    // --- Profile operations ---

    pub fn create_profile(&self, user_id: i64, company_id: Option<i64>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO profiles (user_id, company_id) VALUES (?1, ?2)",
            params![user_id, company_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_profile(&self, user_id: i64) -> Result<Option<Profile>> {
        self.conn
            .query_row(
                &format!("{} WHERE p.user_id = ?1", PROFILE_SELECT),
                [user_id],
                Self::row_to_profile,
            )
            .optional()
            .context("Failed to load profile")
    }

    /// Applies `update`, creating the profile first if the user has none.
    pub fn update_profile(&self, user_id: i64, update: &ProfileUpdate) -> Result<Profile> {
        let current = match self.get_profile(user_id)? {
            Some(profile) => profile,
            None => {
                debug!(user_id, "creating missing profile");
                self.create_profile(user_id, None)?;
                self.get_profile(user_id)?
                    .ok_or_else(|| anyhow!("Profile for user #{} vanished", user_id))?
            }
        };

        let company_id = update.company_id.unwrap_or(current.company_id);
        let department_id = update.department_id.unwrap_or(current.department_id);
        let manager_id = update.manager_id.unwrap_or(current.manager_id);
        let is_company_admin = update.is_company_admin.unwrap_or(current.is_company_admin);

        if let Some(department_id) = department_id {
            let department = self
                .get_department(department_id)?
                .ok_or_else(|| anyhow!("Department #{} not found", department_id))?;
            if company_id != Some(department.company_id) {
                bail!("Department belongs to a different company");
            }
        }
        if manager_id == Some(user_id) {
            bail!("A user cannot manage themselves");
        }

        self.conn.execute(
            "UPDATE profiles SET company_id = ?1, department_id = ?2, manager_id = ?3, is_company_admin = ?4
             WHERE user_id = ?5",
            params![company_id, department_id, manager_id, is_company_admin, user_id],
        )?;
        self.get_profile(user_id)?
            .ok_or_else(|| anyhow!("Profile for user #{} vanished", user_id))
    }

    /// Users whose profile sits in any of `department_ids`.
    pub fn member_ids_of_departments(&self, department_ids: &[i64]) -> Result<Vec<i64>> {
        if department_ids.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT user_id FROM profiles WHERE department_id IN ({}) ORDER BY user_id",
            placeholders(department_ids.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(department_ids.iter()), |row| row.get(0))?;
        rows.collect::<Result<Vec<i64>, _>>()
            .context("Failed to list department members")
    }

    pub fn subordinate_ids(&self, manager_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM profiles WHERE manager_id = ?1 ORDER BY user_id")?;
        let rows = stmt.query_map([manager_id], |row| row.get(0))?;
        rows.collect::<Result<Vec<i64>, _>>()
            .context("Failed to list subordinates")
    }

    fn row_to_profile(row: &rusqlite::Row) -> rusqlite::Result<Profile> {
        Ok(Profile {
            id: row.get(0)?,
            user_id: row.get(1)?,
            company_id: row.get(2)?,
            company_name: row.get(3)?,
            department_id: row.get(4)?,
            manager_id: row.get(5)?,
            is_company_admin: row.get(6)?,
        })
    }

    // --- Feedback request operations ---

    pub fn create_feedback_request(&self, request: &NewFeedbackRequest) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO feedback_requests (requester_id, requested_to_id, project_name, comment, due_date, questionnaire_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                request.requester_id,
                request.requested_to_id,
                request.project_name,
                request.comment,
                request.due_date,
                request.questionnaire_id
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_feedback_request(&self, id: i64) -> Result<Option<FeedbackRequest>> {
        self.conn
            .query_row(
                &format!("{} WHERE r.id = ?1", REQUEST_SELECT),
                [id],
                Self::row_to_request,
            )
            .optional()
            .context("Failed to load feedback request")
    }

    pub fn list_requests_made(&self, requester_id: i64) -> Result<Vec<FeedbackRequest>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE r.requester_id = ?1 ORDER BY r.due_date DESC, r.id DESC",
            REQUEST_SELECT
        ))?;
        let rows = stmt.query_map([requester_id], Self::row_to_request)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list requests made")
    }

    pub fn list_requests_assigned(
        &self,
        requested_to_id: i64,
        status: Option<RequestStatus>,
    ) -> Result<Vec<FeedbackRequest>> {
        let mut sql = format!("{} WHERE r.requested_to_id = ?1", REQUEST_SELECT);
        if status.is_some() {
            sql.push_str(" AND r.status = ?2");
        }
        sql.push_str(" ORDER BY r.due_date DESC, r.id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = match status {
            Some(s) => stmt.query_map(params![requested_to_id, s], Self::row_to_request)?,
            None => stmt.query_map([requested_to_id], Self::row_to_request)?,
        };
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list assigned requests")
    }

    /// Pending requests for feedback about any of `subject_ids`.
    pub fn pending_count_about(&self, subject_ids: &[i64]) -> Result<i64> {
        if subject_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM feedback_requests WHERE status = 'pending' AND requester_id IN ({})",
            placeholders(subject_ids.len())
        );
        let count = self
            .conn
            .query_row(&sql, params_from_iter(subject_ids.iter()), |row| row.get(0))?;
        Ok(count)
    }

    fn row_to_request(row: &rusqlite::Row) -> rusqlite::Result<FeedbackRequest> {
        Ok(FeedbackRequest {
            id: row.get(0)?,
            requester_id: row.get(1)?,
            requester_name: row.get(2)?,
            requested_to_id: row.get(3)?,
            requested_to_name: row.get(4)?,
            project_name: row.get(5)?,
            comment: row.get(6)?,
            due_date: row.get(7)?,
            status: row.get(8)?,
            questionnaire_id: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    // --- Feedback operations ---

    /// Stores the feedback for a pending request and completes the request,
    /// all in one transaction.
    pub fn submit_feedback(&self, request_id: i64, feedback: &NewFeedback) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;

        let status: RequestStatus = tx
            .query_row(
                "SELECT status FROM feedback_requests WHERE id = ?1",
                [request_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| anyhow!("Feedback request #{} not found", request_id))?;
        if status == RequestStatus::Completed {
            bail!("Feedback request #{} is already completed", request_id);
        }

        let feedback_id = Self::insert_feedback(&tx, request_id, feedback)?;

        tx.execute(
            "UPDATE feedback_requests SET status = ?1 WHERE id = ?2",
            params![RequestStatus::Completed, request_id],
        )?;
        tx.commit()?;

        debug!(request_id, feedback_id, "feedback submitted");
        Ok(feedback_id)
    }

    /// Feedback nobody asked for: records an already-completed request from
    /// `subject_id` to `author_id` together with its feedback.
    pub fn record_unsolicited_feedback(
        &self,
        author_id: i64,
        subject_id: i64,
        project_name: &str,
        due_date: chrono::NaiveDate,
        feedback: &NewFeedback,
    ) -> Result<(i64, i64)> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO feedback_requests (requester_id, requested_to_id, project_name, due_date)
             VALUES (?1, ?2, ?3, ?4)",
            params![subject_id, author_id, project_name, due_date],
        )
        .context("Failed to create feedback request")?;
        let request_id = tx.last_insert_rowid();

        let feedback_id = Self::insert_feedback(&tx, request_id, feedback)?;
        tx.execute(
            "UPDATE feedback_requests SET status = ?1 WHERE id = ?2",
            params![RequestStatus::Completed, request_id],
        )?;
        tx.commit()?;

        debug!(request_id, feedback_id, author_id, subject_id, "unsolicited feedback recorded");
        Ok((request_id, feedback_id))
    }

    fn insert_feedback(conn: &Connection, request_id: i64, feedback: &NewFeedback) -> Result<i64> {
        conn.execute(
            "INSERT INTO feedback (feedback_request_id, rating, teamwork_rating, communication_rating,
                                   initiative_rating, technical_skills_rating, problem_solving_rating,
                                   keywords, comments, feedback)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                request_id,
                feedback.rating,
                feedback.teamwork_rating,
                feedback.communication_rating,
                feedback.initiative_rating,
                feedback.technical_skills_rating,
                feedback.problem_solving_rating,
                feedback.keywords,
                feedback.comments,
                feedback.feedback
            ],
        )
        .context("Failed to store feedback")?;
        let feedback_id = conn.last_insert_rowid();

        for score in &feedback.trait_ratings {
            conn.execute(
                "INSERT INTO trait_ratings (feedback_id, trait_id, rating) VALUES (?1, ?2, ?3)",
                params![feedback_id, score.trait_id, score.rating],
            )
            .with_context(|| format!("Failed to store rating for trait #{}", score.trait_id))?;
        }

        Ok(feedback_id)
    }

    pub fn get_feedback_for_request(&self, request_id: i64) -> Result<Option<Feedback>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM feedback f WHERE f.feedback_request_id = ?1",
                    FEEDBACK_COLUMNS
                ),
                [request_id],
                Self::row_to_feedback,
            )
            .optional()
            .context("Failed to load feedback")
    }

    /// Completed feedback about `user_id` (they requested it), oldest first.
    pub fn completed_feedback_about(&self, user_id: i64) -> Result<Vec<Feedback>> {
        self.completed_feedback_about_any(&[user_id])
    }

    pub fn completed_feedback_about_any(&self, subject_ids: &[i64]) -> Result<Vec<Feedback>> {
        if subject_ids.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT {} FROM feedback f
             JOIN feedback_requests r ON f.feedback_request_id = r.id
             WHERE r.status = 'completed' AND r.requester_id IN ({})
             ORDER BY f.id",
            FEEDBACK_COLUMNS,
            placeholders(subject_ids.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(subject_ids.iter()), Self::row_to_feedback)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to load completed feedback")
    }

    /// Average overall rating received by any of `subject_ids`.
    pub fn average_rating_about(&self, subject_ids: &[i64]) -> Result<Option<f64>> {
        if subject_ids.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "SELECT AVG(f.rating) FROM feedback f
             JOIN feedback_requests r ON f.feedback_request_id = r.id
             WHERE r.status = 'completed' AND r.requester_id IN ({})",
            placeholders(subject_ids.len())
        );
        let avg = self
            .conn
            .query_row(&sql, params_from_iter(subject_ids.iter()), |row| row.get(0))?;
        Ok(avg)
    }

    pub fn list_feedback_entries(&self, scope: &FeedbackScope) -> Result<Vec<FeedbackEntry>> {
        let mut sql = format!(
            "SELECT {},
                    r.project_name,
                    r.requester_id,
                    COALESCE(NULLIF(TRIM(a.first_name || ' ' || a.last_name), ''), a.username),
                    r.requested_to_id,
                    COALESCE(NULLIF(TRIM(b.first_name || ' ' || b.last_name), ''), b.username)
             FROM feedback f
             JOIN feedback_requests r ON f.feedback_request_id = r.id
             JOIN users a ON r.requester_id = a.id
             JOIN users b ON r.requested_to_id = b.id
             WHERE r.status = 'completed'",
            FEEDBACK_COLUMNS
        );
        let mut args: Vec<i64> = vec![];
        match scope {
            FeedbackScope::All => {}
            FeedbackScope::Company(company_id) => {
                sql.push_str(
                    " AND r.requester_id IN (SELECT user_id FROM profiles WHERE company_id = ?1)",
                );
                args.push(*company_id);
            }
            FeedbackScope::Subjects(ids) => {
                if ids.is_empty() {
                    return Ok(vec![]);
                }
                sql.push_str(&format!(" AND r.requester_id IN ({})", placeholders(ids.len())));
                args.extend(ids.iter().copied());
            }
        }
        sql.push_str(" ORDER BY f.id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok(FeedbackEntry {
                feedback: Self::row_to_feedback(row)?,
                project_name: row.get(12)?,
                subject_id: row.get(13)?,
                subject_name: row.get(14)?,
                author_id: row.get(15)?,
                author_name: row.get(16)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list feedback")
    }

    pub fn trait_ratings_for_feedback(&self, feedback_id: i64) -> Result<Vec<TraitRating>> {
        let mut stmt = self.conn.prepare(
            "SELECT tr.feedback_id, tr.trait_id, t.name, tr.rating
             FROM trait_ratings tr JOIN traits t ON tr.trait_id = t.id
             WHERE tr.feedback_id = ?1 ORDER BY t.name",
        )?;
        let rows = stmt.query_map([feedback_id], |row| {
            Ok(TraitRating {
                feedback_id: row.get(0)?,
                trait_id: row.get(1)?,
                trait_name: row.get(2)?,
                rating: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list trait ratings")
    }

    fn row_to_feedback(row: &rusqlite::Row) -> rusqlite::Result<Feedback> {
        Ok(Feedback {
            id: row.get(0)?,
            feedback_request_id: row.get(1)?,
            rating: row.get(2)?,
            teamwork_rating: row.get(3)?,
            communication_rating: row.get(4)?,
            initiative_rating: row.get(5)?,
            technical_skills_rating: row.get(6)?,
            problem_solving_rating: row.get(7)?,
            keywords: row.get(8)?,
            comments: row.get(9)?,
            feedback: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    // --- Questionnaire and trait operations ---

    pub fn create_trait(&self, name: &str) -> Result<i64> {
        self.conn
            .execute("INSERT INTO traits (name) VALUES (?1)", [name])
            .with_context(|| format!("Failed to create trait '{}'", name))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_or_create_trait(&self, name: &str) -> Result<i64> {
        let existing: Option<i64> = self
            .conn
            .query_row("SELECT id FROM traits WHERE name = ?1", [name], |row| row.get(0))
            .optional()?;
        match existing {
            Some(id) => Ok(id),
            None => self.create_trait(name),
        }
    }

    pub fn list_traits(&self) -> Result<Vec<Trait>> {
        let mut stmt = self.conn.prepare("SELECT id, name FROM traits ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(Trait {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list traits")
    }

    pub fn create_questionnaire(&self, title: &str, created_by: i64, trait_ids: &[i64]) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO questionnaires (title, created_by) VALUES (?1, ?2)",
            params![title, created_by],
        )?;
        let id = tx.last_insert_rowid();
        Self::set_questionnaire_traits(&tx, id, trait_ids)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_questionnaire(&self, id: i64) -> Result<Option<Questionnaire>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, created_by, created_at FROM questionnaires WHERE id = ?1",
                [id],
                |row| {
                    Ok(Questionnaire {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        created_by: row.get(2)?,
                        created_at: row.get(3)?,
                        traits: vec![],
                    })
                },
            )
            .optional()?;

        match row {
            Some(mut q) => {
                q.traits = self.questionnaire_traits(q.id)?;
                Ok(Some(q))
            }
            None => Ok(None),
        }
    }

    /// Questionnaires, optionally only those created by one user.
    pub fn list_questionnaires(&self, created_by: Option<i64>) -> Result<Vec<Questionnaire>> {
        let mut sql =
            String::from("SELECT id, title, created_by, created_at FROM questionnaires");
        if created_by.is_some() {
            sql.push_str(" WHERE created_by = ?1");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");

        let map = |row: &rusqlite::Row| -> rusqlite::Result<Questionnaire> {
            Ok(Questionnaire {
                id: row.get(0)?,
                title: row.get(1)?,
                created_by: row.get(2)?,
                created_at: row.get(3)?,
                traits: vec![],
            })
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = match created_by {
            Some(user_id) => stmt.query_map([user_id], map)?,
            None => stmt.query_map([], map)?,
        };
        let mut questionnaires = rows
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list questionnaires")?;
        for q in &mut questionnaires {
            q.traits = self.questionnaire_traits(q.id)?;
        }
        Ok(questionnaires)
    }

    pub fn update_questionnaire(&self, id: i64, title: &str, trait_ids: &[i64]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let n = tx.execute(
            "UPDATE questionnaires SET title = ?1 WHERE id = ?2",
            params![title, id],
        )?;
        if n == 0 {
            bail!("Questionnaire #{} not found", id);
        }
        tx.execute(
            "DELETE FROM questionnaire_traits WHERE questionnaire_id = ?1",
            [id],
        )?;
        Self::set_questionnaire_traits(&tx, id, trait_ids)?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_questionnaire(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM questionnaires WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    fn set_questionnaire_traits(conn: &Connection, questionnaire_id: i64, trait_ids: &[i64]) -> Result<()> {
        for (position, trait_id) in trait_ids.iter().enumerate() {
            conn.execute(
                "INSERT OR IGNORE INTO questionnaire_traits (questionnaire_id, trait_id, position)
                 VALUES (?1, ?2, ?3)",
                params![questionnaire_id, trait_id, position as i64],
            )
            .with_context(|| format!("Unknown trait #{}", trait_id))?;
        }
        Ok(())
    }

    fn questionnaire_traits(&self, questionnaire_id: i64) -> Result<Vec<Trait>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.name FROM questionnaire_traits qt
             JOIN traits t ON qt.trait_id = t.id
             WHERE qt.questionnaire_id = ?1 ORDER BY qt.position",
        )?;
        let rows = stmt.query_map([questionnaire_id], |row| {
            Ok(Trait {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list questionnaire traits")
    }
}

// --- Helpers ---

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn build_tree(departments: &[Department], parent: Option<i64>) -> Vec<DepartmentTree> {
    departments
        .iter()
        .filter(|d| d.parent_id == parent)
        .map(|d| DepartmentTree {
            id: d.id,
            name: d.name.clone(),
            manager_id: d.manager_id,
            children: build_tree(departments, Some(d.id)),
        })
        .collect()
}
