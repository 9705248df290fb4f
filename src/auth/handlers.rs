use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::Json;
use rusqlite::params;
use serde::Deserialize;
use serde_json::json;

use crate::auth::{password, session};
use crate::db;
use crate::error::{AppError, AppResult};
use crate::extractors::{session_token, CurrentUser, MaybeUser};
use crate::state::AppState;

// -- Request types --

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub phone: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: String,
    pub email: String,
    pub password: String,
    /// Optional; a `user<N>` name is generated when absent.
    pub username: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct UpdatePasswordRequest {
    #[serde(rename = "oldPassword")]
    pub old_password: String,
    #[serde(rename = "newPassword")]
    pub new_password: String,
}

// -- Cookie helpers --

fn session_cookie(name: &str, token: &str, max_age_hours: u64) -> String {
    let max_age_secs = max_age_hours * 3600;
    format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        name, token, max_age_secs
    )
}

fn clear_session_cookie(name: &str) -> String {
    format!("{}=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0", name)
}

// -- Handlers --

/// POST /auth/register — create an account and log it straight in.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<Response> {
    let phone = req.phone.trim().to_string();
    let first_name = req.first_name.trim().to_string();
    let last_name = req.last_name.trim().to_string();
    let email = req.email.trim().to_string();

    if phone.is_empty() {
        return Err(AppError::BadRequest("Phone is required".into()));
    }
    if first_name.is_empty() || last_name.is_empty() {
        return Err(AppError::BadRequest(
            "First and last name are required".into(),
        ));
    }
    if email.is_empty() {
        return Err(AppError::BadRequest("Email is required".into()));
    }
    if req.password.is_empty() {
        return Err(AppError::BadRequest("Password is required".into()));
    }

    let user_id = uuid::Uuid::now_v7().to_string();
    let username = {
        let conn = state.db.get()?;

        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM users WHERE email = ?1 OR phone = ?2",
            params![email, phone],
            |row| row.get(0),
        )?;
        if exists {
            return Err(AppError::Conflict("User already exists".into()));
        }

        let username = match req.username.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => {
                let taken: bool = conn.query_row(
                    "SELECT COUNT(*) > 0 FROM users WHERE username = ?1",
                    params![name],
                    |row| row.get(0),
                )?;
                if taken {
                    return Err(AppError::Conflict("User already exists".into()));
                }
                name.to_string()
            }
            _ => next_generated_username(&conn)?,
        };

        let hash = password::hash_password(&req.password)?;
        conn.execute(
            "INSERT INTO users (id, username, first_name, last_name, email, phone, password_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![user_id, username, first_name, last_name, email, phone, hash],
        )
        .map_err(|e| {
            // Two registrations racing on the same identity: the unique
            // indexes decide, and the loser sees the same conflict as the
            // up-front check.
            if is_unique_violation(&e) {
                AppError::Conflict("User already exists".into())
            } else {
                e.into()
            }
        })?;

        username
    };

    // Registration doubles as login.
    let token = session::create_session(&state.db, &user_id, state.config.auth.session_hours)?;

    Ok((
        StatusCode::CREATED,
        AppendHeaders([(
            header::SET_COOKIE,
            session_cookie(
                &state.config.auth.cookie_name,
                &token,
                state.config.auth.session_hours,
            ),
        )]),
        Json(json!({
            "message": "Registered successfully",
            "username": username,
            "id": user_id,
        })),
    )
        .into_response())
}

/// POST /auth/login — the login string is matched against both the email
/// and phone columns. The failure message never says which part was wrong.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Response> {
    let login = req.login.trim();

    let found = if login.is_empty() || req.password.is_empty() {
        None
    } else {
        let conn = state.db.get()?;
        lookup_credentials(&conn, login)
    };

    let (user_id, hash) = match found {
        Some(row) => row,
        None => return Err(AppError::BadRequest("Invalid login or password".into())),
    };

    if !password::verify_password(&req.password, &hash) {
        return Err(AppError::BadRequest("Invalid login or password".into()));
    }

    let user = {
        let conn = state.db.get()?;
        db::get_user(&conn, &user_id)?
    };

    let token = session::create_session(&state.db, &user_id, state.config.auth.session_hours)?;

    Ok((
        StatusCode::OK,
        AppendHeaders([(
            header::SET_COOKIE,
            session_cookie(
                &state.config.auth.cookie_name,
                &token,
                state.config.auth.session_hours,
            ),
        )]),
        Json(json!({
            "message": "Logged in",
            "user": user,
            "redirect": "/",
        })),
    )
        .into_response())
}

/// GET /auth/me — idempotent read of the current identity.
pub async fn me(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
) -> AppResult<Response> {
    let snapshot = match user {
        Some(current) => {
            let conn = state.db.get().ok();
            // A vanished user row resolves to anonymous, same as a dead session.
            conn.and_then(|c| db::get_user(&c, &current.id).ok())
        }
        None => None,
    };

    Ok(Json(json!({ "user": snapshot })).into_response())
}

/// POST /auth/logout — delete the session and clear the cookie.
pub async fn logout(
    State(state): State<AppState>,
    request: axum::http::Request<Body>,
) -> AppResult<Response> {
    let (parts, _body) = request.into_parts();

    if let Some(token) = session_token(&parts, &state.config.auth.cookie_name) {
        let _ = session::delete_session(&state.db, token);
    }

    Ok((
        StatusCode::OK,
        AppendHeaders([(
            header::SET_COOKIE,
            clear_session_cookie(&state.config.auth.cookie_name),
        )]),
        Json(json!({ "message": "Logged out" })),
    )
        .into_response())
}

/// POST /auth/update-password — verify the old password, store a new hash.
pub async fn update_password(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<UpdatePasswordRequest>,
) -> AppResult<Response> {
    if req.old_password.is_empty() || req.new_password.is_empty() {
        return Err(AppError::BadRequest(
            "Both old and new password are required".into(),
        ));
    }

    let conn = state.db.get()?;
    let hash: String = conn
        .query_row(
            "SELECT password_hash FROM users WHERE id = ?1",
            params![user.id],
            |row| row.get(0),
        )
        .map_err(|_| AppError::Unauthorized)?;

    if !password::verify_password(&req.old_password, &hash) {
        return Err(AppError::Unauthorized);
    }

    let new_hash = password::hash_password(&req.new_password)?;
    conn.execute(
        "UPDATE users SET password_hash = ?1 WHERE id = ?2",
        params![new_hash, user.id],
    )?;

    Ok(Json(json!({ "message": "Password updated" })).into_response())
}

// -- Query helpers --

/// Find (id, password_hash) for a login string that may be an email or a
/// phone number. Lookup failure of any kind reads as "no such user".
fn lookup_credentials(conn: &rusqlite::Connection, login: &str) -> Option<(String, String)> {
    conn.query_row(
        "SELECT id, password_hash FROM users WHERE email = ?1 OR phone = ?1",
        params![login],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .ok()
}

/// Next free `user<N>` name: one past the highest generated suffix in use.
fn next_generated_username(conn: &rusqlite::Connection) -> Result<String, rusqlite::Error> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(CAST(substr(username, 5) AS INTEGER)), 0)
         FROM users WHERE username GLOB 'user[0-9]*'",
        [],
        |row| row.get(0),
    )?;
    Ok(format!("user{}", max + 1))
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, run_migrations};
    use crate::state::DbPool;

    fn test_pool() -> (tempfile::TempDir, DbPool) {
        let tmp = tempfile::tempdir().unwrap();
        let pool = create_pool(&tmp.path().join("test.db")).unwrap();
        run_migrations(&pool).unwrap();
        (tmp, pool)
    }

    fn insert_user(conn: &rusqlite::Connection, username: &str, email: &str, phone: &str) {
        conn.execute(
            "INSERT INTO users (id, username, email, phone, password_hash)
             VALUES (?1, ?1, ?2, ?3, 'x')",
            params![username, email, phone],
        )
        .unwrap();
    }

    #[test]
    fn generated_username_starts_at_one() {
        let (_tmp, pool) = test_pool();
        let conn = pool.get().unwrap();
        assert_eq!(next_generated_username(&conn).unwrap(), "user1");
    }

    #[test]
    fn generated_username_follows_highest_suffix() {
        let (_tmp, pool) = test_pool();
        let conn = pool.get().unwrap();
        insert_user(&conn, "user5", "five@x.com", "+7(000)-000-00-05");
        insert_user(&conn, "user12", "twelve@x.com", "+7(000)-000-00-12");
        assert_eq!(next_generated_username(&conn).unwrap(), "user13");
    }

    #[test]
    fn generated_username_ignores_non_numeric_suffixes() {
        let (_tmp, pool) = test_pool();
        let conn = pool.get().unwrap();
        insert_user(&conn, "username_taken", "a@x.com", "+7(000)-000-00-01");
        insert_user(&conn, "alice", "b@x.com", "+7(000)-000-00-02");
        assert_eq!(next_generated_username(&conn).unwrap(), "user1");
    }

    #[test]
    fn lookup_credentials_matches_email_and_phone() {
        let (_tmp, pool) = test_pool();
        let conn = pool.get().unwrap();
        insert_user(&conn, "alice", "a@x.com", "+7(900)-000-00-01");

        assert!(lookup_credentials(&conn, "a@x.com").is_some());
        assert!(lookup_credentials(&conn, "+7(900)-000-00-01").is_some());
        assert!(lookup_credentials(&conn, "b@x.com").is_none());
    }

    #[test]
    fn unique_violation_detected() {
        let (_tmp, pool) = test_pool();
        let conn = pool.get().unwrap();
        insert_user(&conn, "alice", "a@x.com", "+7(900)-000-00-01");
        let err = conn
            .execute(
                "INSERT INTO users (id, username, email, phone, password_hash)
                 VALUES ('u2', 'bob', 'a@x.com', '+7(900)-000-00-02', 'x')",
                [],
            )
            .unwrap_err();
        assert!(is_unique_violation(&err));
    }
}
