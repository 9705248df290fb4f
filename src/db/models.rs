use serde::{Deserialize, Serialize};

/// Public snapshot of a user, as returned by `/auth/me`, login, and
/// profile update. The password hash never leaves the users table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub avatar: Option<String>,
    pub role: String,
    pub created_at: String,
}
