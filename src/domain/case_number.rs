// Case-number extraction and canonicalization

use regex::Regex;
use std::sync::OnceLock;

/// Free-text inputs are capped before scanning.
pub const MAX_INPUT_CHARS: usize = 50_000;

// Standard syntax: two-digit year, 2-4 letter class, digits-digits.
// Example: 25CR123456-789
static STANDARD_REGEX: OnceLock<Regex> = OnceLock::new();

// LexisNexis syntax: county prefix digits, four-digit year, class, whitespace,
// digits. Example: 7892025CR 123456 (county 789, year 2025).
static LEXIS_NEXIS_REGEX: OnceLock<Regex> = OnceLock::new();

fn standard_regex() -> &'static Regex {
    STANDARD_REGEX.get_or_init(|| {
        Regex::new(r"\b(\d{2})\s*([A-Za-z]{2,4})\s*(\d+)\s*-\s*(\d+)\b").unwrap()
    })
}

fn lexis_nexis_regex() -> &'static Regex {
    LEXIS_NEXIS_REGEX.get_or_init(|| {
        Regex::new(r"\b(\d{1,3})(\d{4})([A-Za-z]{2,4})\s+(\d+)\b").unwrap()
    })
}

/// Extract every recognizable case number from a free-text blob, in order of
/// first appearance, without duplicates. Zero matches yields an empty list.
pub fn extract_case_numbers(input: &str) -> Vec<String> {
    let input = truncate_on_char_boundary(input, MAX_INPUT_CHARS);

    let mut found: Vec<(usize, String)> = Vec::new();

    for caps in standard_regex().captures_iter(input) {
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        let canonical = format!(
            "{}{}{}-{}",
            &caps[1],
            caps[2].to_uppercase(),
            &caps[3],
            &caps[4]
        );
        found.push((start, canonical));
    }

    for caps in lexis_nexis_regex().captures_iter(input) {
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        let year = &caps[2];
        let canonical = format!(
            "{}{}{}-{}",
            &year[2..],
            caps[3].to_uppercase(),
            &caps[4],
            &caps[1]
        );
        found.push((start, canonical));
    }

    found.sort_by_key(|(start, _)| *start);

    let mut seen = std::collections::HashSet::new();
    found
        .into_iter()
        .filter_map(|(_, canonical)| seen.insert(canonical.clone()).then_some(canonical))
        .collect()
}

fn truncate_on_char_boundary(input: &str, max: usize) -> &str {
    if input.len() <= max {
        return input;
    }
    let mut end = max;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_standard_syntax() {
        assert_eq!(
            extract_case_numbers("25CR123456-789"),
            vec!["25CR123456-789"]
        );
        assert_eq!(
            extract_case_numbers("please check 24cv000123-456 for me"),
            vec!["24CV000123-456"]
        );
    }

    #[test]
    fn extracts_lexis_nexis_syntax() {
        assert_eq!(
            extract_case_numbers("7892025CR 123456"),
            vec!["25CR123456-789"]
        );
        // Two-digit county prefix
        assert_eq!(
            extract_case_numbers("892024CVD 000321"),
            vec!["24CVD000321-89"]
        );
    }

    #[test]
    fn both_syntaxes_normalize_to_the_same_key() {
        let standard = extract_case_numbers("25CR123456-789");
        let lexis = extract_case_numbers("7892025CR 123456");
        assert_eq!(standard, lexis);
    }

    #[test]
    fn preserves_order_and_removes_duplicates() {
        let text = "first 25CR111111-100 then 25CR222222-200 and again 25CR111111-100";
        assert_eq!(
            extract_case_numbers(text),
            vec!["25CR111111-100", "25CR222222-200"]
        );
    }

    #[test]
    fn mixed_syntaxes_dedupe_against_each_other() {
        let text = "25CR123456-789 aka 7892025CR 123456";
        assert_eq!(extract_case_numbers(text), vec!["25CR123456-789"]);
    }

    #[test]
    fn no_matches_yields_empty_list() {
        assert!(extract_case_numbers("").is_empty());
        assert!(extract_case_numbers("no case numbers here").is_empty());
        assert!(extract_case_numbers("123456 alone is not enough").is_empty());
    }

    #[test]
    fn extraction_is_idempotent() {
        let text = "25CR123456-789 plus 7892025CR 123456 plus 24CV000123-456";
        let once = extract_case_numbers(text);
        let again = extract_case_numbers(&once.join(" "));
        assert_eq!(once, again);
    }

    #[test]
    fn oversized_input_is_truncated_not_rejected() {
        let mut text = "x".repeat(MAX_INPUT_CHARS);
        text.push_str(" 25CR123456-789");
        // The case number sits past the cap and is ignored.
        assert!(extract_case_numbers(&text).is_empty());
    }
}
