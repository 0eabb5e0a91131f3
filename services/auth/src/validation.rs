//! Input validation utilities

use regex::Regex;
use std::sync::OnceLock;

/// Check that a string has the canonical, hyphenated UUID-v4 shape
///
/// Token identifiers end up inside ledger keys, so anything else is
/// rejected before it can be used to address a record.
pub fn is_uuid_v4(value: &str) -> bool {
    static UUID_V4_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = UUID_V4_REGEX.get_or_init(|| {
        Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
            .expect("Failed to compile UUID regex")
    });
    regex.is_match(value)
}

/// Validate a username presented at login
pub fn validate_username(username: &str) -> Result<(), String> {
    if username.is_empty() {
        return Err("Username is required".to_string());
    }

    if username.len() > 32 {
        return Err("Username must be at most 32 characters long".to_string());
    }

    static USERNAME_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = USERNAME_REGEX
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9_]+$").expect("Failed to compile username regex"));

    if !regex.is_match(username) {
        return Err("Username can only contain letters, numbers, and underscores".to_string());
    }

    Ok(())
}

/// Validate a password presented at login
///
/// Strength rules belong to registration; here only presence and an upper
/// bound that keeps hashing cost predictable are enforced.
pub fn validate_password(password: &str) -> Result<(), String> {
    if password.is_empty() {
        return Err("Password is required".to_string());
    }

    if password.len() > 128 {
        return Err("Password must be at most 128 characters long".to_string());
    }

    Ok(())
}

/// Validate a password chosen at registration
///
/// At least 8 characters, with at least one letter and one digit.
pub fn validate_new_password(password: &str) -> Result<(), String> {
    validate_password(password)?;

    if password.chars().count() < 8 {
        return Err("Password must be at least 8 characters long".to_string());
    }

    if !password.chars().any(char::is_alphabetic) || !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("Password must contain at least one letter and one digit".to_string());
    }

    Ok(())
}

/// Validate that a token field was supplied
pub fn require_token<'a>(field: &str, value: &'a str) -> Result<&'a str, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{field} is required"));
    }
    Ok(trimmed)
}
