//! Common utility functions used across the codebase.

/// Truncates a string to at most `max_chars` characters, adding "..." if
/// truncated. UTF-8 safe: respects character boundaries.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    // Byte length <= max_chars implies char count <= max_chars.
    if s.len() <= max_chars {
        return s.to_string();
    }

    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s.to_string();
    }

    const SUFFIX: &str = "...";
    if max_chars <= SUFFIX.len() {
        return SUFFIX.chars().take(max_chars).collect();
    }

    let truncated: String = s.chars().take(max_chars - SUFFIX.len()).collect();
    format!("{}{}", truncated, SUFFIX)
}

/// Push an error message onto a bounded list, dropping the oldest entries
/// when full. Stage reports keep a small sample rather than every failure.
pub fn push_bounded_error(errors: &mut Vec<String>, message: String, cap: usize) {
    if errors.len() >= cap {
        errors.remove(0);
    }
    errors.push(truncate_str(&message, 300));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_truncation_needed() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello", 5), "hello");
        assert_eq!(truncate_str("", 10), "");
    }

    #[test]
    fn truncation_ascii() {
        assert_eq!(truncate_str("hello world", 8), "hello...");
        assert_eq!(truncate_str("abcdefghij", 6), "abc...");
    }

    #[test]
    fn truncation_multibyte() {
        assert_eq!(truncate_str("日本語テスト", 5), "日本...");
        assert_eq!(truncate_str("héllo wörld", 8), "héllo...");
    }

    #[test]
    fn tiny_limits() {
        assert_eq!(truncate_str("hello", 3), "...");
        assert_eq!(truncate_str("hello", 1), ".");
        assert_eq!(truncate_str("hello", 0), "");
    }

    #[test]
    fn bounded_error_list_drops_oldest() {
        let mut errors = Vec::new();
        for i in 0..12 {
            push_bounded_error(&mut errors, format!("err {}", i), 10);
        }
        assert_eq!(errors.len(), 10);
        assert_eq!(errors[0], "err 2");
        assert_eq!(errors[9], "err 11");
    }

    mod proptest_truncate {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn result_within_limit(s in ".*", n in 0usize..500) {
                let result = truncate_str(&s, n);
                prop_assert!(result.chars().count() <= n.max(1));
            }

            #[test]
            fn never_panics(s in "\\PC{0,300}", n in 0usize..600) {
                let _ = truncate_str(&s, n);
            }
        }
    }
}
