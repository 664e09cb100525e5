//! URL and identifier normalization helpers shared by protocol, schema, and
//! filter handling.

use crate::{Result, bad_request};

/// Normalizes a protocol or schema URL: strips a trailing slash and
/// lower-cases nothing (URLs are case-sensitive), matching the "cleaned"
/// form every stored index and filter comparison assumes.
///
/// # Errors
/// Returns [`crate::Error::BadRequest`] if `url` cannot be parsed as a URL.
pub fn clean_url(url: &str) -> Result<String> {
    if !url.contains("://") {
        return Err(bad_request!("invalid URL `{url}`: missing scheme"));
    }
    let mut cleaned = url.trim().to_string();
    while cleaned.ends_with('/') {
        cleaned.pop();
    }
    if cleaned.is_empty() {
        return Err(bad_request!("invalid URL `{url}`: empty after normalization"));
    }
    Ok(cleaned)
}

/// Validates that a URL is already in normalized form, returning an error
/// naming the offending field if not.
///
/// # Errors
/// Returns [`crate::Error::BadRequest`] if `url` is not already normalized.
pub fn validate_url_normalized(field: &str, url: &str) -> Result<()> {
    let cleaned = clean_url(url)?;
    if cleaned != url {
        return Err(bad_request!("{field} `{url}` is not normalized, expected `{cleaned}`"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_slash() {
        assert_eq!(clean_url("https://example.com/protocol/").unwrap(), "https://example.com/protocol");
    }

    #[test]
    fn rejects_unnormalized() {
        assert!(validate_url_normalized("protocol", "https://example.com/protocol/").is_err());
    }
}
