pub mod auth;
pub mod friends;
pub mod likes;
pub mod posts;
pub mod profile;
