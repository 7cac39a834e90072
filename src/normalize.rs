//! Query normalization.
//!
//! Every lookup key in the crate (response cache, keyword index, mismatch guard)
//! goes through [`normalize_query`], so two spellings of the same question that
//! differ only in case, punctuation or spacing share one key.

use once_cell::sync::Lazy;
use regex::Regex;

static NON_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]+").expect("punctuation regex is valid"));

/// Lower-case, fold `ё` into `е`, strip punctuation and collapse whitespace.
///
/// ```rust
/// use helpdesk_resolver::normalize::normalize_query;
///
/// assert_eq!(normalize_query("  Касса   НЕ включается?! "), "касса не включается");
/// assert_eq!(normalize_query("Ошибка №5: принтёр"), "ошибка 5 принтер");
/// ```
pub fn normalize_query(text: &str) -> String {
    let lowered = text.to_lowercase().replace('ё', "е");
    let stripped = NON_WORD.replace_all(&lowered, " ");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_and_strips() {
        assert_eq!(normalize_query("Hello,   World!!"), "hello world");
        assert_eq!(normalize_query("\tкасса\nне-включается"), "касса не включается");
    }

    #[test]
    fn test_normalize_punctuation_only_is_empty() {
        assert_eq!(normalize_query("?!..."), "");
        assert_eq!(normalize_query("   "), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_query("Почему НЕ печатает чек?");
        assert_eq!(normalize_query(&once), once);
    }
}
