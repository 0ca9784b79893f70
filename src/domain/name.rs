// Party-name normalization for Smart Search queries

use chrono::{NaiveDate, Utc};

/// Compound surname prefixes that travel with the final token.
const SURNAME_PREFIXES: [&str; 10] = [
    "van", "von", "de", "der", "da", "del", "di", "bin", "le", "la",
];

/// Normalize a free-form person name into `Last, First [Middle...]`.
///
/// A single comma with text on both sides is taken as already last-first and
/// passes through with collapsed whitespace. Otherwise the final whitespace
/// token plus any contiguous run of surname prefixes before it become the
/// surname. Single tokens pass through unchanged; anything unparseable
/// yields an empty string.
pub fn normalize_name(input: &str) -> String {
    let collapsed = collapse_whitespace(input);
    if collapsed.is_empty() {
        return String::new();
    }

    if collapsed.contains(',') {
        let parts: Vec<&str> = collapsed.split(',').collect();
        if parts.len() == 2 {
            let last = collapse_whitespace(parts[0]);
            let first = collapse_whitespace(parts[1]);
            if !last.is_empty() && !first.is_empty() {
                return format!("{}, {}", last, first);
            }
        }
        return String::new();
    }

    let tokens: Vec<&str> = collapsed.split(' ').collect();
    if tokens.len() == 1 {
        return collapsed;
    }

    // Walk left from the final token, absorbing contiguous surname prefixes,
    // always leaving at least one token for the given-name portion.
    let mut surname_start = tokens.len() - 1;
    while surname_start > 1 && SURNAME_PREFIXES.contains(&tokens[surname_start - 1].to_lowercase().as_str()) {
        surname_start -= 1;
    }

    let surname = tokens[surname_start..].join(" ");
    let given = tokens[..surname_start].join(" ");
    format!("{}, {}", surname, given)
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a date of birth. Accepts the common portal input formats and rejects
/// any date strictly after today.
pub fn parse_date_of_birth(input: &str) -> Option<NaiveDate> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let formats = ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%m/%d/%y"];
    let parsed = formats
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())?;

    if parsed > Utc::now().date_naive() {
        return None;
    }
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use proptest::prelude::*;

    #[test]
    fn first_last_becomes_last_first() {
        assert_eq!(normalize_name("Jane Doe"), "Doe, Jane");
        assert_eq!(normalize_name("Jane Marie Doe"), "Doe, Jane Marie");
    }

    #[test]
    fn comma_form_passes_through_normalized() {
        assert_eq!(normalize_name("Doe, Jane"), "Doe, Jane");
        assert_eq!(normalize_name("  Doe ,  Jane   Marie "), "Doe, Jane Marie");
    }

    #[test]
    fn surname_prefixes_stay_with_the_surname() {
        assert_eq!(normalize_name("Ludwig van Beethoven"), "van Beethoven, Ludwig");
        assert_eq!(normalize_name("Maria de la Cruz"), "de la Cruz, Maria");
        assert_eq!(normalize_name("Omar bin Rashid"), "bin Rashid, Omar");
    }

    #[test]
    fn prefixes_never_consume_the_whole_name() {
        // The given-name portion keeps at least one token.
        assert_eq!(normalize_name("Van Helsing"), "Helsing, Van");
    }

    #[test]
    fn hyphenated_tokens_are_preserved() {
        assert_eq!(normalize_name("Mary Smith-Jones"), "Smith-Jones, Mary");
    }

    #[test]
    fn single_token_passes_through() {
        assert_eq!(normalize_name("Madonna"), "Madonna");
    }

    #[test]
    fn unparseable_inputs_yield_empty() {
        assert_eq!(normalize_name(""), "");
        assert_eq!(normalize_name("   "), "");
        assert_eq!(normalize_name(","), "");
        assert_eq!(normalize_name("Doe,"), "");
        assert_eq!(normalize_name("a, b, c"), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        for input in [
            "Jane Doe",
            "Doe, Jane",
            "Ludwig van Beethoven",
            "Maria de la Cruz",
            "Madonna",
            "Mary Smith-Jones",
        ] {
            let once = normalize_name(input);
            assert_eq!(normalize_name(&once), once, "input: {}", input);
        }
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent_for_arbitrary_inputs(input in "[A-Za-z ,-]{0,40}") {
            let once = normalize_name(&input);
            prop_assert_eq!(normalize_name(&once), once);
        }
    }

    #[test]
    fn dob_accepts_common_formats() {
        let expected = NaiveDate::from_ymd_opt(1980, 1, 1).unwrap();
        assert_eq!(parse_date_of_birth("1980-01-01"), Some(expected));
        assert_eq!(parse_date_of_birth("01/01/1980"), Some(expected));
        assert_eq!(parse_date_of_birth("01-01-1980"), Some(expected));
    }

    #[test]
    fn dob_rejects_future_dates() {
        let next_year = Utc::now().date_naive().year() + 1;
        assert_eq!(parse_date_of_birth(&format!("{}-06-15", next_year)), None);
        // Today itself is allowed (strictly-greater rejection).
        let today = Utc::now().date_naive();
        assert_eq!(
            parse_date_of_birth(&today.format("%Y-%m-%d").to_string()),
            Some(today)
        );
    }

    #[test]
    fn dob_rejects_garbage() {
        assert_eq!(parse_date_of_birth(""), None);
        assert_eq!(parse_date_of_birth("not a date"), None);
        assert_eq!(parse_date_of_birth("13/45/2020"), None);
    }
}
