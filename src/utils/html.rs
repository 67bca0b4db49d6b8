// src/utils/html.rs

/// Sanitizes a participant-supplied violation reason before it is stored for
/// proctor display.
///
/// No tag survives: markup is stripped, the remaining text is escaped and trimmed.
/// This serves as a fail-safe against Stored XSS in the proctor views.
pub fn clean_reason(input: &str) -> String {
    let cleaned = ammonia::Builder::empty().clean(input).to_string();
    cleaned.trim().to_string()
}
