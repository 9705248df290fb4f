//! Disk persistence for multipart uploads.
//!
//! Files land under the uploads root (`avatars/` or `posts/`) and are
//! referenced by their `/uploads/...` URL path in entity records. Names
//! embed a millisecond timestamp (plus a random suffix for post media) so
//! concurrent uploads cannot collide and clients get stable URLs.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::Rng;

use crate::error::{AppError, AppResult};

pub const AVATAR_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/webp"];

pub const POST_MEDIA_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/webp",
    "video/mp4",
];

pub const MAX_POST_MEDIA_BYTES: usize = 20 * 1024 * 1024;

/// A file written to the uploads directory.
#[derive(Debug, Clone)]
pub struct SavedFile {
    /// Path the client uses, e.g. `/uploads/posts/cat-1715000000000-42137.png`
    pub url_path: String,
    pub disk_path: PathBuf,
}

/// Persist an avatar image as `<millis><ext>` under `avatars/`.
pub fn save_avatar(
    uploads_root: &Path,
    original_name: &str,
    content_type: &str,
    data: &[u8],
) -> AppResult<SavedFile> {
    if !AVATAR_TYPES.contains(&content_type) {
        return Err(AppError::BadRequest("Unsupported avatar file type".into()));
    }

    let name = format!(
        "{}{}",
        Utc::now().timestamp_millis(),
        extension_for(original_name, content_type)
    );
    write_file(uploads_root, "avatars", &name, data)
}

/// Persist post media as `<stem>-<millis>-<rand><ext>` under `posts/`.
pub fn save_post_media(
    uploads_root: &Path,
    original_name: &str,
    content_type: &str,
    data: &[u8],
) -> AppResult<SavedFile> {
    if !POST_MEDIA_TYPES.contains(&content_type) {
        return Err(AppError::BadRequest("Unsupported file type".into()));
    }
    if data.len() > MAX_POST_MEDIA_BYTES {
        return Err(AppError::BadRequest("File is too large".into()));
    }

    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    let name = format!(
        "{}-{}-{}{}",
        file_stem(original_name),
        Utc::now().timestamp_millis(),
        suffix,
        extension_for(original_name, content_type)
    );
    write_file(uploads_root, "posts", &name, data)
}

/// Best-effort removal of a previously saved file by its URL path.
/// Used both for replaced/deleted attachments and to roll back a file
/// write whose database insert failed.
pub fn remove_quietly(uploads_root: &Path, url_path: &str) {
    if let Some(path) = disk_path_for(uploads_root, url_path) {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::debug!("Could not remove upload {}: {}", path.display(), e);
        }
    }
}

/// Map a stored `/uploads/...` URL path back onto the uploads root.
/// Rejects anything that is not a plain two-component path below the root.
pub fn disk_path_for(uploads_root: &Path, url_path: &str) -> Option<PathBuf> {
    let rel = url_path.strip_prefix("/uploads/")?;
    let mut components = rel.split('/');
    let dir = components.next()?;
    let name = components.next()?;
    if components.next().is_some() {
        return None;
    }
    if dir.contains("..") || name.contains("..") || name.is_empty() {
        return None;
    }
    Some(uploads_root.join(dir).join(name))
}

fn write_file(uploads_root: &Path, subdir: &str, name: &str, data: &[u8]) -> AppResult<SavedFile> {
    let dir = uploads_root.join(subdir);
    std::fs::create_dir_all(&dir)?;
    let disk_path = dir.join(name);
    std::fs::write(&disk_path, data)?;
    Ok(SavedFile {
        url_path: format!("/uploads/{}/{}", subdir, name),
        disk_path,
    })
}

/// Extension (with leading dot) from the client filename, falling back to
/// one guessed from the content type when the filename has none.
fn extension_for(original_name: &str, content_type: &str) -> String {
    if let Some(ext) = Path::new(original_name).extension() {
        return format!(".{}", ext.to_string_lossy().to_lowercase());
    }
    mime_guess::get_mime_extensions_str(content_type)
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}

/// Sanitized stem of the client filename; path separators and anything
/// exotic collapse to '-'.
fn file_stem(original_name: &str) -> String {
    let stem = Path::new(original_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}
