use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use rusqlite::params;
use serde_json::json;

use crate::db;
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::state::AppState;
use crate::uploads;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/user/update", post(update_profile))
        .layer(DefaultBodyLimit::max(
            uploads::MAX_POST_MEDIA_BYTES + 1024 * 1024,
        ))
}

/// POST /user/update — multipart profile fields plus optional avatar.
/// Last write wins; the response carries the fresh snapshot.
pub async fn update_profile(
    State(state): State<AppState>,
    user: CurrentUser,
    mut multipart: Multipart,
) -> AppResult<Response> {
    let mut first_name: Option<String> = None;
    let mut last_name: Option<String> = None;
    let mut phone: Option<String> = None;
    let mut email: Option<String> = None;
    let mut upload: Option<(String, String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        match field.name() {
            Some("firstName") => first_name = Some(field.text().await.map_err(bad_multipart)?),
            Some("lastName") => last_name = Some(field.text().await.map_err(bad_multipart)?),
            Some("phone") => phone = Some(field.text().await.map_err(bad_multipart)?),
            Some("email") => email = Some(field.text().await.map_err(bad_multipart)?),
            Some("avatar") => {
                let name = field.file_name().unwrap_or("avatar").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await.map_err(bad_multipart)?;
                if !data.is_empty() {
                    upload = Some((name, content_type, data.to_vec()));
                }
            }
            _ => {}
        }
    }

    let first_name = required_field(first_name, "First name")?;
    let last_name = required_field(last_name, "Last name")?;
    let phone = required_field(phone, "Phone")?;
    let email = required_field(email, "Email")?;

    let old_avatar: Option<String> = {
        let conn = state.db.get()?;

        // The new identity fields must not collide with another account.
        let taken: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM users WHERE (email = ?1 OR phone = ?2) AND id != ?3",
            params![email, phone, user.id],
            |row| row.get(0),
        )?;
        if taken {
            return Err(AppError::Conflict("Email or phone already in use".into()));
        }

        conn.query_row(
            "SELECT avatar FROM users WHERE id = ?1",
            params![user.id],
            |row| row.get(0),
        )
        .map_err(|_| AppError::Unauthorized)?
    };

    let saved = match &upload {
        Some((name, content_type, data)) => Some(uploads::save_avatar(
            state.config.uploads_path(),
            name,
            content_type,
            data,
        )?),
        None => None,
    };
    let avatar = saved
        .as_ref()
        .map(|s| s.url_path.clone())
        .or_else(|| old_avatar.clone());

    let updated = {
        let conn = state.db.get()?;
        conn.execute(
            "UPDATE users SET first_name = ?1, last_name = ?2, phone = ?3, email = ?4, avatar = ?5
             WHERE id = ?6",
            params![first_name, last_name, phone, email, avatar, user.id],
        )
        .map_err(|e| {
            if crate::auth::handlers::is_unique_violation(&e) {
                AppError::Conflict("Email or phone already in use".into())
            } else {
                AppError::from(e)
            }
        })
    };
    if let Err(e) = updated {
        if let Some(s) = &saved {
            uploads::remove_quietly(state.config.uploads_path(), &s.url_path);
        }
        return Err(e);
    }

    // The replaced avatar file is unreferenced now.
    if saved.is_some() {
        if let Some(old) = &old_avatar {
            uploads::remove_quietly(state.config.uploads_path(), old);
        }
    }

    let fresh = {
        let conn = state.db.get()?;
        db::get_user(&conn, &user.id)?
    };

    Ok(Json(json!({ "message": "Profile updated", "user": fresh })).into_response())
}

fn required_field(value: Option<String>, label: &str) -> Result<String, AppError> {
    let value = value.map(|v| v.trim().to_string()).unwrap_or_default();
    if value.is_empty() {
        return Err(AppError::BadRequest(format!("{} is required", label)));
    }
    Ok(value)
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> AppError {
    AppError::BadRequest(format!("Invalid multipart request: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_field_trims_and_accepts() {
        assert_eq!(
            required_field(Some("  Alice ".into()), "First name").unwrap(),
            "Alice"
        );
    }

    #[test]
    fn required_field_rejects_missing_and_blank() {
        assert!(required_field(None, "Email").is_err());
        assert!(required_field(Some("   ".into()), "Email").is_err());
    }
}
