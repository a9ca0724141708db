//! Canonical form for subject names.
//!
//! Markers and subjects arrive with human-provided or slugified names
//! ("Anna Nováková", "anna-novakova"). Any name-keyed query or filter in
//! this crate compares the canonical form produced here; the store
//! backends apply the equivalent transformation at the SQL layer.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Normalize a subject name for comparison: strip accents/diacritics,
/// lowercase, replace dashes with spaces, collapse whitespace.
pub fn normalize_subject(name: &str) -> String {
    let stripped: String = name.nfd().filter(|c| !is_combining_mark(*c)).collect();
    let lowered = stripped.to_lowercase().replace('-', " ");
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compare two names under the canonical form.
pub fn same_subject(a: &str, b: &str) -> bool {
    normalize_subject(a) == normalize_subject(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_diacritics_and_case() {
        assert_eq!(normalize_subject("Anna Nováková"), "anna novakova");
        assert_eq!(normalize_subject("Jürgen MÜLLER"), "jurgen muller");
    }

    #[test]
    fn test_dashes_and_whitespace() {
        assert_eq!(normalize_subject("anna-marie  novakova"), "anna marie novakova");
        assert_eq!(normalize_subject("  Anna\tNováková "), "anna novakova");
    }

    #[test]
    fn test_same_subject_across_forms() {
        assert!(same_subject("Anna Nováková", "anna-novakova"));
        assert!(!same_subject("Anna Nováková", "Jana Nováková"));
    }
}
