use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Key used by the rule stage: case-insensitive, whitespace collapsed, nothing else.
///
/// Diacritics and punctuation are significant here. "Gráinne" and "Grainne" are
/// left for the fuzzy stage to decide.
pub fn exact_key(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Aggressive normalization for similarity scoring: Unicode decomposition with
/// combining marks dropped, apostrophes removed, punctuation turned into spaces.
pub fn fuzzy_key(name: &str) -> String {
    let without_apostrophes = name
        .replace("'s ", " ")
        .replace('\u{2019}', "'")
        .replace('\'', "");

    without_apostrophes
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .replace(|c: char| !c.is_alphanumeric() && c != ' ', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `fuzzy_key` with its tokens sorted, so word order does not affect scores.
pub fn token_sorted_key(name: &str) -> String {
    let key = fuzzy_key(name);
    let mut tokens: Vec<&str> = key.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Collects every explicit year (three or four digits) in a free-text description.
pub fn years_in(text: &str) -> Vec<i32> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3 || token.len() == 4)
        .filter_map(|token| token.parse::<i32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_key_is_case_and_space_insensitive() {
        assert_eq!(exact_key("  Fionn   MAC Cumhaill "), "fionn mac cumhaill");
        assert_eq!(exact_key("Gráinne"), "gráinne");
        assert_ne!(exact_key("Gráinne"), exact_key("Grainne"));
    }

    #[test]
    fn test_fuzzy_key_strips_marks_and_punctuation() {
        assert_eq!(fuzzy_key("Gráinne Ní Mháille"), "grainne ni mhaille");
        assert_eq!(fuzzy_key("Ó Néill, Aodh"), "o neill aodh");
        assert_eq!(fuzzy_key("Brian's Fort"), "brian fort");
        assert_eq!(fuzzy_key("Cú Chulainn"), "cu chulainn");
    }

    #[test]
    fn test_token_sorted_key() {
        assert_eq!(token_sorted_key("Ó Néill, Aodh"), "aodh neill o");
        assert_eq!(token_sorted_key("Aodh Ó Néill"), "aodh neill o");
    }

    #[test]
    fn test_years_in_description() {
        assert_eq!(years_in("Irish chieftain (1550-1616)"), vec![1550, 1616]);
        assert!(years_in("legendary hunter-warrior").is_empty());
    }
}
