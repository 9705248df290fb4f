use crate::error::AppError;

/// Hash a plaintext password with bcrypt.
pub fn hash_password(plain: &str) -> Result<String, AppError> {
    bcrypt::hash(plain, bcrypt::DEFAULT_COST)
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verify plaintext against a stored hash - constant-time via bcrypt.
/// A malformed hash verifies as false rather than erroring.
pub fn verify_password(plain: &str, hash: &str) -> bool {
    bcrypt::verify(plain, hash).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let hash = hash_password("secret1").unwrap();
        assert!(verify_password("secret1", &hash));
    }

    #[test]
    fn wrong_password_fails_verification() {
        let hash = hash_password("secret1").unwrap();
        assert!(!verify_password("secret2", &hash));
    }

    #[test]
    fn hashes_are_salted() {
        let h1 = hash_password("secret1").unwrap();
        let h2 = hash_password("secret1").unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn malformed_hash_verifies_false() {
        assert!(!verify_password("secret1", "not-a-bcrypt-hash"));
    }
}
