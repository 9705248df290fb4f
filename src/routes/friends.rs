use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct FriendActionRequest {
    #[serde(rename = "friendId")]
    pub friend_id: String,
}

#[derive(Debug, Serialize)]
pub struct FriendEntry {
    pub id: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: String,
    pub avatar: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/friends", get(list_friends))
        .route("/friends/request", post(request_friend))
        .route("/friends/accept", post(accept_friend))
}

// -- Handlers --

/// GET /friends — accepted friendships, regardless of who initiated.
pub async fn list_friends(
    State(state): State<AppState>,
    user: CurrentUser,
) -> AppResult<Response> {
    let friends = {
        let conn = state.db.get()?;
        query_friends(&conn, &user.id)?
    };

    Ok(Json(json!({ "friends": friends })).into_response())
}

/// POST /friends/request — create a pending friendship toward another user.
pub async fn request_friend(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<FriendActionRequest>,
) -> AppResult<Response> {
    if req.friend_id == user.id {
        return Err(AppError::BadRequest(
            "Cannot send a friend request to yourself".into(),
        ));
    }

    let conn = state.db.get()?;

    let _: String = conn
        .query_row(
            "SELECT id FROM users WHERE id = ?1",
            params![req.friend_id],
            |row| row.get(0),
        )
        .map_err(|_| AppError::NotFound)?;

    // One relation per pair, whichever side initiated.
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM friends
         WHERE (user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1)",
        params![user.id, req.friend_id],
        |row| row.get(0),
    )?;
    if exists {
        return Err(AppError::BadRequest("Friend request already exists".into()));
    }

    let id = uuid::Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO friends (id, user_id, friend_id) VALUES (?1, ?2, ?3)",
        params![id, user.id, req.friend_id],
    )
    .map_err(|e| {
        if crate::auth::handlers::is_unique_violation(&e) {
            AppError::BadRequest("Friend request already exists".into())
        } else {
            e.into()
        }
    })?;

    Ok(Json(json!({ "message": "Friend request sent" })).into_response())
}

/// POST /friends/accept — the recipient confirms a pending request.
pub async fn accept_friend(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<FriendActionRequest>,
) -> AppResult<Response> {
    let conn = state.db.get()?;

    let changed = conn.execute(
        "UPDATE friends SET status = 'accepted'
         WHERE user_id = ?1 AND friend_id = ?2 AND status = 'pending'",
        params![req.friend_id, user.id],
    )?;

    if changed == 0 {
        return Err(AppError::NotFound);
    }

    Ok(Json(json!({ "message": "Friend request accepted" })).into_response())
}

// -- Query helpers --

pub fn query_friends(
    conn: &rusqlite::Connection,
    user_id: &str,
) -> Result<Vec<FriendEntry>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.first_name, u.last_name, u.avatar
         FROM friends f
         JOIN users u ON (u.id = f.user_id OR u.id = f.friend_id) AND u.id != ?1
         WHERE (f.user_id = ?1 OR f.friend_id = ?1) AND f.status = 'accepted'",
    )?;

    let friends = stmt
        .query_map(params![user_id], |row| {
            Ok(FriendEntry {
                id: row.get(0)?,
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                avatar: row.get(3)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(friends)
}
