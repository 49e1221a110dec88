//! Anti-forgery token scraping from rendered page source.
//!
//! The Forms designer page embeds its request verification token in an inline
//! script (`"antiForgeryToken":"..."`). The markup is undocumented, so the
//! pattern is configurable; its first capture group is the token.

use crate::error::AuthError;
use once_cell::sync::Lazy;
use regex::Regex;

/// Default scraping pattern.
pub const DEFAULT_ANTIFORGERY_PATTERN: &str =
    r#"antiForgeryToken["']?\s*[:=]\s*["']([^"']+)["']"#;

pub static DEFAULT_ANTIFORGERY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(DEFAULT_ANTIFORGERY_PATTERN).expect("valid anti-forgery pattern"));

/// Extract the token captured by `pattern` from `source`.
pub fn extract_antiforgery_token(source: &str, pattern: &Regex) -> Result<String, AuthError> {
    pattern
        .captures_iter(source)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .find(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or(AuthError::AntiForgeryTokenNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_pattern() -> Regex {
        DEFAULT_ANTIFORGERY_REGEX.clone()
    }

    #[test]
    fn test_extracts_from_json_blob() {
        let page = r#"<script>window.OfficeFormServerInfo = {"userId":"u","antiForgeryToken":"CfDJ8Abc-_123","x":1};</script>"#;
        assert_eq!(
            extract_antiforgery_token(page, &default_pattern()).unwrap(),
            "CfDJ8Abc-_123"
        );
    }

    #[test]
    fn test_extracts_from_assignment() {
        let page = "var antiForgeryToken = 'tok-2';";
        assert_eq!(extract_antiforgery_token(page, &default_pattern()).unwrap(), "tok-2");
    }

    #[test]
    fn test_missing_token_is_an_error() {
        let page = r#"<html><body>Sign in</body></html>"#;
        assert!(matches!(
            extract_antiforgery_token(page, &default_pattern()),
            Err(AuthError::AntiForgeryTokenNotFound)
        ));

        let empty = r#"{"antiForgeryToken":"  "}"#;
        assert!(extract_antiforgery_token(empty, &default_pattern()).is_err());
    }

    #[test]
    fn test_custom_pattern() {
        let pattern = Regex::new(r#"name="__RequestVerificationToken" value="([^"]+)""#).unwrap();
        let page = r#"<input name="__RequestVerificationToken" value="form-tok" type="hidden">"#;
        assert_eq!(extract_antiforgery_token(page, &pattern).unwrap(), "form-tok");
    }
}
