//! The single correctness rule for submitted answers.
//!
//! Both sides are trimmed and case-folded, then compared for exact equality.
//! There is no partial credit and no numeric tolerance: `"3.0"` does not match
//! `"3"`.

/// Normalise an answer for comparison.
#[must_use]
pub fn normalize_answer(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Grade `submitted` against the stored answer key.
#[must_use]
pub fn is_correct(answer_key: &str, submitted: &str) -> bool {
    normalize_answer(answer_key) == normalize_answer(submitted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grading_ignores_case_and_surrounding_whitespace() {
        assert!(is_correct("paris", "  Paris "));
        assert!(is_correct(" B\n", "b"));
    }

    #[test]
    fn inner_whitespace_and_numbers_are_exact() {
        assert!(!is_correct("New Delhi", "NewDelhi"));
        assert!(!is_correct("3", "3.0"));
    }

    #[test]
    fn empty_answer_only_matches_empty_key() {
        assert!(!is_correct("A", "   "));
        assert!(is_correct("", " "));
    }

    #[test]
    fn case_folding_is_unicode_aware() {
        assert!(is_correct("ÉCOLE", "école"));
    }
}
