//! Utility functions shared across `Gas Town`.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Safely handles multi-byte UTF-8 characters (emoji, CJK, accented
/// characters) by using character boundaries instead of byte indices.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            // Trim trailing whitespace for cleaner output
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}
