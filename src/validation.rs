//! Input validation and output-context escaping.
//!
//! Everything the core writes to disk that a later UI may render passes
//! through here first: control characters are stripped, lengths capped, and
//! text escaped for the context it will be shown in.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, SecurityError};

/// Placeholder recorded when a caller-supplied origin is not an IP address.
pub const UNKNOWN_ORIGIN: &str = "0.0.0.0";

pub const MAX_SUBJECT_LEN: usize = 128;
pub const MAX_SESSION_ID_LEN: usize = 128;
pub const MAX_DETAILS_LEN: usize = 4096;
pub const MAX_METADATA_VALUE_LEN: usize = 1024;
pub const MAX_ORIGIN_LEN: usize = 45;
pub const MAX_LOGICAL_NAME_LEN: usize = 128;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._@:+\-]+$").unwrap_or_else(|_| unreachable!("static pattern"))
});

static LOGICAL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_\-][A-Za-z0-9._\-]*$").unwrap_or_else(|_| unreachable!("static pattern"))
});

/// Rendering context a value is escaped for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Escape {
    #[default]
    Plain,
    Html,
    Js,
    Url,
}

/// Rule applied by [`validate_input`].
#[derive(Debug, Clone)]
pub struct InputRule {
    pub max_length: usize,
    pub pattern: Option<Regex>,
    pub escape: Escape,
}

impl Default for InputRule {
    fn default() -> Self {
        Self {
            max_length: 1000,
            pattern: None,
            escape: Escape::Plain,
        }
    }
}

impl InputRule {
    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = max;
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| SecurityError::validation(format!("invalid pattern: {}", e)))?;
        self.pattern = Some(re);
        Ok(self)
    }

    pub fn escape(mut self, escape: Escape) -> Self {
        self.escape = escape;
        self
    }
}

/// Trim, check, and escape a user-supplied value.
pub fn validate_input(value: &str, field: &str, rule: &InputRule) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SecurityError::validation(format!("{} cannot be empty", field)));
    }
    if trimmed.chars().count() > rule.max_length {
        return Err(SecurityError::validation(format!(
            "{} exceeds maximum length of {}",
            field, rule.max_length
        )));
    }
    if let Some(ref re) = rule.pattern
        && !re.is_match(trimmed)
    {
        return Err(SecurityError::validation(format!("{} format invalid", field)));
    }

    let cleaned = strip_control(trimmed);
    Ok(escape(&cleaned, rule.escape))
}

/// Validate an identifier (subject id, session id, rate-limit key).
pub fn validate_identifier(value: &str, field: &str, max: usize) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SecurityError::validation(format!("{} cannot be empty", field)));
    }
    if trimmed.len() > max {
        return Err(SecurityError::validation(format!(
            "{} exceeds maximum length of {}",
            field, max
        )));
    }
    if !IDENTIFIER.is_match(trimmed) {
        return Err(SecurityError::validation(format!("{} format invalid", field)));
    }
    Ok(trimmed.to_string())
}

/// Validate a logical file name for the atomic store. No separators, no
/// leading dot, no traversal.
pub fn validate_logical_name(name: &str) -> Result<&str> {
    if name.is_empty() || name.len() > MAX_LOGICAL_NAME_LEN || !LOGICAL_NAME.is_match(name) {
        return Err(SecurityError::validation(format!(
            "invalid logical file name: {:?}",
            name
        )));
    }
    Ok(name)
}

/// Strip control characters and cap the length (in chars). Never fails.
pub fn sanitize_field(value: &str, max: usize) -> String {
    strip_control(value.trim()).chars().take(max).collect()
}

/// Sanitize and HTML-escape free text destined for audit `details`.
pub fn sanitize_details(value: &str) -> String {
    // Escape after truncation so an entity is never cut in half
    escape_html(&sanitize_field(value, MAX_DETAILS_LEN))
}

/// Origins must be IP addresses; anything else becomes [`UNKNOWN_ORIGIN`].
pub fn normalize_origin(origin: Option<&str>) -> String {
    origin
        .map(str::trim)
        .filter(|o| o.len() <= MAX_ORIGIN_LEN)
        .filter(|o| o.parse::<IpAddr>().is_ok())
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string())
}

pub fn escape(value: &str, context: Escape) -> String {
    match context {
        Escape::Plain => value.to_string(),
        Escape::Html => escape_html(value),
        Escape::Js => escape_js(value),
        Escape::Url => encode_url(value),
    }
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn escape_js(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '<' => out.push_str("\\u003C"),
            '>' => out.push_str("\\u003E"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// Percent-encode everything except RFC 3986 unreserved characters.
pub fn encode_url(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

fn strip_control(value: &str) -> String {
    value.chars().filter(|c| !c.is_control()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_value_passes_through() {
        let rule = InputRule::default().max_length(50);
        assert_eq!(
            validate_input("test@example.com", "email", &rule).unwrap(),
            "test@example.com"
        );
    }

    #[test]
    fn strips_surrounding_whitespace() {
        let rule = InputRule::default().max_length(20);
        assert_eq!(validate_input("  test  ", "username", &rule).unwrap(), "test");
    }

    #[test]
    fn rejects_empty_and_oversized() {
        let rule = InputRule::default().max_length(10);
        let empty = validate_input("", "username", &rule).unwrap_err();
        assert!(empty.to_string().contains("cannot be empty"));

        let long = validate_input(&"x".repeat(1001), "field", &rule).unwrap_err();
        assert!(long.to_string().contains("exceeds"));
    }

    #[test]
    fn pattern_is_enforced() {
        let rule = InputRule::default().pattern(r"^[a-z0-9]+$").unwrap();
        assert_eq!(validate_input("user123", "username", &rule).unwrap(), "user123");

        let err = validate_input("user@123", "username", &rule).unwrap_err();
        assert!(err.to_string().contains("format invalid"));
    }

    #[test]
    fn html_context_escapes_tags() {
        let rule = InputRule::default().escape(Escape::Html);
        let out = validate_input("<script>alert('xss')</script>", "comment", &rule).unwrap();
        assert!(!out.contains("<script>"));
        assert!(out.contains("&lt;script&gt;"));
    }

    #[test]
    fn url_encoding_keeps_only_unreserved_characters() {
        assert_eq!(encode_url("a-b_c.d~e"), "a-b_c.d~e");
        assert_eq!(encode_url("J. Doe/1980?x=1&y"), "J.%20Doe%2F1980%3Fx%3D1%26y");
        assert_eq!(encode_url("é"), "%C3%A9");
    }

    #[test]
    fn url_context_encodes_spaces() {
        let rule = InputRule::default().escape(Escape::Url);
        let out = validate_input("hello world", "url", &rule).unwrap();
        assert_eq!(out, "hello%20world");
    }

    #[test]
    fn js_context_escapes_quotes() {
        let rule = InputRule::default().escape(Escape::Js);
        let out = validate_input("test\"value", "script", &rule).unwrap();
        assert_eq!(out, "test\\\"value");
    }

    #[test]
    fn control_characters_are_removed() {
        assert_eq!(sanitize_field("ab\u{0}c\u{1b}[31md\u{1f}", 100), "abc[31md");
        assert_eq!(sanitize_field("abcdef", 3), "abc");
    }

    #[test]
    fn details_are_escaped_after_truncation() {
        let long = format!("{}<", "a".repeat(MAX_DETAILS_LEN - 1));
        let out = sanitize_details(&long);
        assert!(out.ends_with("&lt;"));
    }

    #[test]
    fn origins_must_be_ip_addresses() {
        assert_eq!(normalize_origin(Some("192.168.1.1")), "192.168.1.1");
        assert_eq!(
            normalize_origin(Some("2001:0db8:85a3::8a2e:0370:7334")),
            "2001:0db8:85a3::8a2e:0370:7334"
        );
        assert_eq!(normalize_origin(Some("not-an-ip")), UNKNOWN_ORIGIN);
        assert_eq!(normalize_origin(None), UNKNOWN_ORIGIN);
    }

    #[test]
    fn identifiers_are_restricted() {
        assert_eq!(
            validate_identifier(" dr.smith@clinic ", "subject_id", 128).unwrap(),
            "dr.smith@clinic"
        );
        assert!(validate_identifier("a b", "subject_id", 128).is_err());
        assert!(validate_identifier("<x>", "subject_id", 128).is_err());
        assert!(validate_identifier(&"a".repeat(129), "subject_id", 128).is_err());
    }

    #[test]
    fn logical_names_reject_traversal() {
        assert!(validate_logical_name("user_progress.json").is_ok());
        for bad in ["", "../etc/passwd", "a/b", ".hidden", "..", "name\\x"] {
            assert!(validate_logical_name(bad).is_err(), "{:?}", bad);
        }
    }
}
