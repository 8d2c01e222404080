//! Password verification with Argon2id.
//!
//! Verifiers are PHC strings carrying their own salt and parameters;
//! comparison inside the KDF is constant-time.

use anyhow::{anyhow, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordHash, PasswordVerifier};

/// Verify a password against a stored PHC-string verifier.
///
/// A malformed verifier counts as a mismatch rather than an error so that
/// corrupt rows surface as failed logins, not internal faults.
pub fn verify(verifier: &str, password: &str) -> bool {
    match PasswordHash::new(verifier) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Produce a PHC-string verifier for a new password
pub fn hash(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| anyhow!("hashing password: {e}"))
}
