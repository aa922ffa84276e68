//! String helpers
//!
//! Character-boundary-safe truncation and secret masking, used in admin views
//! and to keep upstream error bodies short in logs and attempt records.

/// Longest upstream body excerpt kept in an error message
pub const BODY_PREVIEW_CHARS: usize = 200;

/// Truncate to at most `max_chars` characters without splitting a code point
///
/// ```
/// use cookie_pool_gateway::utils::truncate_str;
///
/// assert_eq!(truncate_str("sso=ÄÖÜ-rest", 6), "sso=ÄÖ");
/// assert_eq!(truncate_str("short", 100), "short");
/// ```
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Truncate and append `suffix` only when something was cut off
///
/// ```
/// use cookie_pool_gateway::utils::truncate_with_suffix;
///
/// assert_eq!(truncate_with_suffix("sso=abcdefgh", 4, "..."), "sso=...");
/// assert_eq!(truncate_with_suffix("sso", 4, "..."), "sso");
/// ```
pub fn truncate_with_suffix(s: &str, max_chars: usize, suffix: &str) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}{}", truncate_str(s, max_chars), suffix)
    }
}

/// Mask a secret, keeping at most `max_visible` leading characters and never
/// more than half of it
///
/// ```
/// use cookie_pool_gateway::utils::redact;
///
/// assert_eq!(redact("sso=abcdefghijkl", 8), "sso=abcd...");
/// assert_eq!(redact("sso=abc", 8), "sso...");
/// ```
pub fn redact(secret: &str, max_visible: usize) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let visible = max_visible.min(secret.chars().count() / 2);
    format!("{}...", truncate_str(secret, visible))
}

/// Single-line, bounded excerpt of an upstream response body
pub fn body_preview(body: &str) -> String {
    let flattened = body.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_with_suffix(&flattened, BODY_PREVIEW_CHARS, "...")
}
