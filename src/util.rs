//! Small helpers shared across the codebase.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Stored failure reasons (buffer / job / reminder diagnostics) are bounded with
/// this so a pathological provider error body cannot bloat the database. Safe on
/// multi-byte UTF-8 input because it walks character boundaries, not bytes.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_truncation_below_limit() {
        assert_eq!(truncate_with_ellipsis("hola", 10), "hola");
        assert_eq!(truncate_with_ellipsis("", 10), "");
    }

    #[test]
    fn truncates_long_ascii() {
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_with_ellipsis("niño año señal", 4), "niño...");
        assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
    }

    #[test]
    fn trims_trailing_whitespace_before_ellipsis() {
        assert_eq!(truncate_with_ellipsis("hola  mundo", 6), "hola...");
    }
}
