//! Slug validation shared by organizations, workspaces and environments.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlugError {
    #[error("slug must be between 2 and 64 characters")]
    Length,
    #[error("slug must match ^[a-z0-9]([a-z0-9-]*[a-z0-9])?$")]
    Charset,
}

/// Validate a slug: lowercase alphanumerics and dashes, no leading or
/// trailing dash, length 2-64.
pub fn validate_slug(slug: &str) -> Result<(), SlugError> {
    if slug.len() < 2 || slug.len() > 64 {
        return Err(SlugError::Length);
    }
    let bytes = slug.as_bytes();
    let inner_ok = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');
    if !inner_ok {
        return Err(SlugError::Charset);
    }
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return Err(SlugError::Charset);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_slugs() {
        for slug in ["ab", "my-workspace", "prod2", "a1-b2-c3", "00"] {
            assert_eq!(validate_slug(slug), Ok(()), "{slug}");
        }
    }

    #[test]
    fn rejects_bad_length() {
        assert_eq!(validate_slug("a"), Err(SlugError::Length));
        assert_eq!(validate_slug(&"x".repeat(65)), Err(SlugError::Length));
    }

    #[test]
    fn rejects_bad_charset() {
        for slug in ["-ab", "ab-", "My-Workspace", "a_b", "a b", "ä-b"] {
            assert_eq!(validate_slug(slug), Err(SlugError::Charset), "{slug}");
        }
    }
}
