use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use rusqlite::params;
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LikeRequest {
    pub post_id: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/likes", post(toggle))
}

/// POST /likes — flip the caller's like on a post.
pub async fn toggle(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<LikeRequest>,
) -> AppResult<Response> {
    let conn = state.db.get()?;
    let (liked, likes_count) = toggle_like(&conn, &user.id, &req.post_id)?;

    Ok(Json(json!({ "liked": liked, "likes_count": likes_count })).into_response())
}

/// Toggle a like and return the new (liked, likes_count) pair.
///
/// Insert-first rather than test-then-act: the UNIQUE(post_id, user_id)
/// index arbitrates concurrent toggles from the same user, so two racing
/// requests cannot both insert. Zero changed rows means the like already
/// existed, which makes this call a removal.
pub fn toggle_like(
    conn: &rusqlite::Connection,
    user_id: &str,
    post_id: &str,
) -> Result<(bool, i64), AppError> {
    let _: String = conn
        .query_row(
            "SELECT id FROM posts WHERE id = ?1",
            params![post_id],
            |row| row.get(0),
        )
        .map_err(|_| AppError::NotFound)?;

    let like_id = uuid::Uuid::now_v7().to_string();
    let inserted = conn.execute(
        "INSERT INTO likes (id, post_id, user_id) VALUES (?1, ?2, ?3)
         ON CONFLICT (post_id, user_id) DO NOTHING",
        params![like_id, post_id, user_id],
    )?;

    let liked = if inserted == 0 {
        conn.execute(
            "DELETE FROM likes WHERE post_id = ?1 AND user_id = ?2",
            params![post_id, user_id],
        )?;
        false
    } else {
        true
    };

    // Always the live aggregate; a stored counter could drift.
    let likes_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM likes WHERE post_id = ?1",
        params![post_id],
        |row| row.get(0),
    )?;

    Ok((liked, likes_count))
}
