use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::extractors::{CurrentUser, MaybeUser};
use crate::state::AppState;
use crate::uploads;

/// A feed entry: the post row joined with its author and the
/// viewer-dependent like fields. `likes_count` is always recomputed from
/// the likes table, never stored.
#[derive(Debug, Serialize)]
pub struct FeedPost {
    pub id: String,
    pub user_id: String,
    pub username: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: String,
    pub avatar: Option<String>,
    pub text: String,
    pub image: Option<String>,
    pub created_at: String,
    pub likes_count: i64,
    pub liked_by_me: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/posts", get(list_posts))
        .route("/posts/create", post(create_post))
        .route("/posts/update/{id}", put(update_post))
        .route("/posts/delete/{id}", delete(delete_post))
        // Multipart bodies carry up to 20 MB of media plus form overhead.
        .layer(DefaultBodyLimit::max(
            uploads::MAX_POST_MEDIA_BYTES + 1024 * 1024,
        ))
}

// -- Handlers --

/// GET /posts — newest first; anonymous viewers get liked_by_me = false.
pub async fn list_posts(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
) -> AppResult<Response> {
    let viewer_id = user.map(|u| u.id);

    let posts = {
        let conn = state.db.get()?;
        query_feed(&conn, viewer_id.as_deref())?
    };

    Ok(Json(posts).into_response())
}

/// POST /posts/create — multipart `text` plus optional image/video.
pub async fn create_post(
    State(state): State<AppState>,
    user: CurrentUser,
    mut multipart: Multipart,
) -> AppResult<Response> {
    let mut text: Option<String> = None;
    let mut upload: Option<(String, String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        match field.name() {
            Some("text") => {
                text = Some(field.text().await.map_err(bad_multipart)?);
            }
            Some("image") | Some("file") => {
                let name = field.file_name().unwrap_or("upload").to_string();
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

    let text = validate_post_text(text.as_deref().unwrap_or(""))?;

    let saved = match &upload {
        Some((name, content_type, data)) => Some(uploads::save_post_media(
            state.config.uploads_path(),
            name,
            content_type,
            data,
        )?),
        None => None,
    };
    let image = saved.as_ref().map(|s| s.url_path.clone());

    let post_id = uuid::Uuid::now_v7().to_string();
    let insert = {
        let conn = state.db.get()?;
        conn.execute(
            "INSERT INTO posts (id, user_id, text, image) VALUES (?1, ?2, ?3, ?4)",
            params![post_id, user.id, text, image],
        )
    };
    if let Err(e) = insert {
        // Roll back the file write rather than orphaning it.
        if let Some(s) = &saved {
            uploads::remove_quietly(state.config.uploads_path(), &s.url_path);
        }
        return Err(e.into());
    }

    let post = {
        let conn = state.db.get()?;
        let (first_name, last_name, avatar): (String, String, Option<String>) = conn.query_row(
            "SELECT first_name, last_name, avatar FROM users WHERE id = ?1",
            params![user.id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        FeedPost {
            id: post_id,
            user_id: user.id,
            username: user.username,
            first_name,
            last_name,
            avatar,
            text,
            image,
            created_at: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            likes_count: 0,
            liked_by_me: false,
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Post created", "post": post })),
    )
        .into_response())
}

/// PUT /posts/update/:id — owner only; multipart `text`, `deleteImage`,
/// optional replacement `image`.
pub async fn update_post(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> AppResult<Response> {
    let (owner_id, old_image): (String, Option<String>) = {
        let conn = state.db.get()?;
        conn.query_row(
            "SELECT user_id, image FROM posts WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| AppError::NotFound)?
    };

    if owner_id != user.id {
        return Err(AppError::Forbidden);
    }

    let mut text: Option<String> = None;
    let mut delete_image = false;
    let mut upload: Option<(String, String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        match field.name() {
            Some("text") => {
                text = Some(field.text().await.map_err(bad_multipart)?);
            }
            Some("deleteImage") => {
                delete_image = field.text().await.map_err(bad_multipart)? == "true";
            }
            Some("image") | Some("file") => {
                let name = field.file_name().unwrap_or("upload").to_string();
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

    let text = validate_post_text(text.as_deref().unwrap_or(""))?;

    let saved = match &upload {
        Some((name, content_type, data)) => Some(uploads::save_post_media(
            state.config.uploads_path(),
            name,
            content_type,
            data,
        )?),
        None => None,
    };

    // A fresh upload wins over the delete flag.
    let image = match (&saved, delete_image) {
        (Some(s), _) => Some(s.url_path.clone()),
        (None, true) => None,
        (None, false) => old_image.clone(),
    };

    let update = {
        let conn = state.db.get()?;
        conn.execute(
            "UPDATE posts SET text = ?1, image = ?2, updated_at = datetime('now') WHERE id = ?3",
            params![text, image, id],
        )
    };
    if let Err(e) = update {
        if let Some(s) = &saved {
            uploads::remove_quietly(state.config.uploads_path(), &s.url_path);
        }
        return Err(e.into());
    }

    // The previous attachment is unreferenced once replaced or deleted.
    if let Some(old) = &old_image {
        if image.as_deref() != Some(old.as_str()) {
            uploads::remove_quietly(state.config.uploads_path(), old);
        }
    }

    Ok(Json(json!({ "success": true, "image": image })).into_response())
}

/// DELETE /posts/delete/:id — owner or administrator.
pub async fn delete_post(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let conn = state.db.get()?;

    let (owner_id, image): (String, Option<String>) = conn
        .query_row(
            "SELECT user_id, image FROM posts WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| AppError::NotFound)?;

    if owner_id != user.id && !user.is_admin() {
        return Err(AppError::Forbidden);
    }

    conn.execute("DELETE FROM posts WHERE id = ?1", params![id])?;

    if let Some(image) = &image {
        uploads::remove_quietly(state.config.uploads_path(), image);
    }

    Ok(Json(json!({ "success": true })).into_response())
}

// -- Query helpers --

pub fn query_feed(
    conn: &rusqlite::Connection,
    viewer_id: Option<&str>,
) -> Result<Vec<FeedPost>, AppError> {
    let uid = viewer_id.unwrap_or("");

    let mut stmt = conn.prepare(
        "SELECT p.id, p.user_id, u.username, u.first_name, u.last_name, u.avatar,
                p.text, p.image, p.created_at,
                COALESCE((SELECT COUNT(*) FROM likes l WHERE l.post_id = p.id), 0) AS likes_count,
                COALESCE((SELECT COUNT(*) > 0 FROM likes l WHERE l.post_id = p.id AND l.user_id = ?1), 0) AS liked_by_me
         FROM posts p
         JOIN users u ON u.id = p.user_id
         ORDER BY p.created_at DESC, p.id DESC",
    )?;

    let posts = stmt
        .query_map(params![uid], |row| {
            Ok(FeedPost {
                id: row.get(0)?,
                user_id: row.get(1)?,
                username: row.get(2)?,
                first_name: row.get(3)?,
                last_name: row.get(4)?,
                avatar: row.get(5)?,
                text: row.get(6)?,
                image: row.get(7)?,
                created_at: row.get(8)?,
                likes_count: row.get(9)?,
                liked_by_me: row.get(10)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(posts)
}

pub fn validate_post_text(raw: &str) -> Result<String, AppError> {
    let text = raw.trim().to_string();
    if text.is_empty() {
        return Err(AppError::BadRequest("Post text is required".into()));
    }
    if text.len() > 2000 {
        return Err(AppError::BadRequest(
            "Post text must be 2000 characters or less".into(),
        ));
    }
    Ok(text)
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> AppError {
    AppError::BadRequest(format!("Invalid multipart request: {}", err))
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

    fn seed_user(conn: &rusqlite::Connection, id: &str) {
        conn.execute(
            "INSERT INTO users (id, username, first_name, last_name, email, phone, password_hash)
             VALUES (?1, ?1, 'Test', 'User', ?1 || '@x.com', '+7-' || ?1, 'x')",
            params![id],
        )
        .unwrap();
    }

    fn seed_post(conn: &rusqlite::Connection, id: &str, user_id: &str, created_at: &str) {
        conn.execute(
            "INSERT INTO posts (id, user_id, text, created_at) VALUES (?1, ?2, 'hello', ?3)",
            params![id, user_id, created_at],
        )
        .unwrap();
    }

    #[test]
    fn validate_post_text_trims() {
        assert_eq!(validate_post_text("  hello  ").unwrap(), "hello");
    }

    #[test]
    fn validate_post_text_rejects_blank() {
        assert!(validate_post_text("   ").is_err());
    }

    #[test]
    fn validate_post_text_rejects_overlong() {
        let long = "x".repeat(2001);
        assert!(validate_post_text(&long).is_err());
    }

    #[test]
    fn feed_is_newest_first() {
        let (_tmp, pool) = test_pool();
        let conn = pool.get().unwrap();
        seed_user(&conn, "u1");
        seed_post(&conn, "p1", "u1", "2025-01-01 10:00:00");
        seed_post(&conn, "p2", "u1", "2025-01-02 10:00:00");

        let feed = query_feed(&conn, None).unwrap();
        let ids: Vec<&str> = feed.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p1"]);
    }

    #[test]
    fn feed_counts_likes_and_flags_viewer() {
        let (_tmp, pool) = test_pool();
        let conn = pool.get().unwrap();
        seed_user(&conn, "u1");
        seed_user(&conn, "u2");
        seed_post(&conn, "p1", "u1", "2025-01-01 10:00:00");
        conn.execute(
            "INSERT INTO likes (id, post_id, user_id) VALUES ('l1', 'p1', 'u1'), ('l2', 'p1', 'u2')",
            [],
        )
        .unwrap();

        let feed = query_feed(&conn, Some("u2")).unwrap();
        assert_eq!(feed[0].likes_count, 2);
        assert!(feed[0].liked_by_me);

        let anon = query_feed(&conn, None).unwrap();
        assert_eq!(anon[0].likes_count, 2);
        assert!(!anon[0].liked_by_me);
    }

    #[test]
    fn feed_count_always_matches_like_rows() {
        let (_tmp, pool) = test_pool();
        let conn = pool.get().unwrap();
        seed_user(&conn, "u1");
        seed_post(&conn, "p1", "u1", "2025-01-01 10:00:00");

        for n in 0..3i64 {
            let rows: i64 = conn
                .query_row("SELECT COUNT(*) FROM likes WHERE post_id = 'p1'", [], |r| {
                    r.get(0)
                })
                .unwrap();
            let feed = query_feed(&conn, None).unwrap();
            assert_eq!(feed[0].likes_count, rows);
            assert_eq!(rows, n);

            let uid = format!("liker{}", n);
            seed_user(&conn, &uid);
            conn.execute(
                "INSERT INTO likes (id, post_id, user_id) VALUES (?1, 'p1', ?2)",
                params![format!("l{}", n), uid],
            )
            .unwrap();
        }
    }
}
