//! Value normalisation for phones, emails, and US states.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::Field;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

/// US state names and their postal codes.
pub const US_STATES: [(&str, &str); 51] = [
    ("alabama", "AL"),
    ("alaska", "AK"),
    ("arizona", "AZ"),
    ("arkansas", "AR"),
    ("california", "CA"),
    ("colorado", "CO"),
    ("connecticut", "CT"),
    ("delaware", "DE"),
    ("district of columbia", "DC"),
    ("florida", "FL"),
    ("georgia", "GA"),
    ("hawaii", "HI"),
    ("idaho", "ID"),
    ("illinois", "IL"),
    ("indiana", "IN"),
    ("iowa", "IA"),
    ("kansas", "KS"),
    ("kentucky", "KY"),
    ("louisiana", "LA"),
    ("maine", "ME"),
    ("maryland", "MD"),
    ("massachusetts", "MA"),
    ("michigan", "MI"),
    ("minnesota", "MN"),
    ("mississippi", "MS"),
    ("missouri", "MO"),
    ("montana", "MT"),
    ("nebraska", "NE"),
    ("nevada", "NV"),
    ("new hampshire", "NH"),
    ("new jersey", "NJ"),
    ("new mexico", "NM"),
    ("new york", "NY"),
    ("north carolina", "NC"),
    ("north dakota", "ND"),
    ("ohio", "OH"),
    ("oklahoma", "OK"),
    ("oregon", "OR"),
    ("pennsylvania", "PA"),
    ("rhode island", "RI"),
    ("south carolina", "SC"),
    ("south dakota", "SD"),
    ("tennessee", "TN"),
    ("texas", "TX"),
    ("utah", "UT"),
    ("vermont", "VT"),
    ("virginia", "VA"),
    ("washington", "WA"),
    ("west virginia", "WV"),
    ("wisconsin", "WI"),
    ("wyoming", "WY"),
];

/// Reduce a phone number to 10 NANP digits. Returns `None` for anything else.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        10 => Some(digits),
        11 if digits.starts_with('1') => Some(digits[1..].to_string()),
        _ => None,
    }
}

/// Lowercase and validate an email address.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    EMAIL_RE.is_match(&email).then_some(email)
}

/// Convert a state name or code to its two-letter postal code.
pub fn normalize_state(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.len() == 2 {
        let upper = trimmed.to_ascii_uppercase();
        return US_STATES
            .iter()
            .any(|(_, code)| *code == upper)
            .then_some(upper);
    }
    let lower = trimmed.to_lowercase();
    US_STATES
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, code)| (*code).to_string())
}

/// Full state name (lowercase) for a postal code.
pub fn state_name(code: &str) -> Option<&'static str> {
    let upper = code.trim().to_ascii_uppercase();
    US_STATES
        .iter()
        .find(|(_, c)| *c == upper)
        .map(|(name, _)| *name)
}

/// Normalise a value for `field`. Unparseable phones and emails are dropped
/// rather than stored in a form later phases cannot use.
pub fn normalize_value(field: Field, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match field {
        Field::Phone => normalize_phone(trimmed),
        Field::Email => normalize_email(trimmed),
        Field::State => Some(normalize_state(trimmed).unwrap_or_else(|| trimmed.to_string())),
        Field::Zip => {
            let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
            (digits.len() == 5).then_some(digits)
        }
        _ => Some(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("(303) 555-1234").as_deref(), Some("3035551234"));
        assert_eq!(normalize_phone("+1 303 555 1234").as_deref(), Some("3035551234"));
        assert_eq!(normalize_phone("555-1234"), None);
    }

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email(" John@Example.COM ").as_deref(), Some("john@example.com"));
        assert_eq!(normalize_email("not-an-email"), None);
    }

    #[test]
    fn state_normalization() {
        assert_eq!(normalize_state("Colorado").as_deref(), Some("CO"));
        assert_eq!(normalize_state("co").as_deref(), Some("CO"));
        assert_eq!(normalize_state("Atlantis"), None);
        assert_eq!(state_name("MD"), Some("maryland"));
    }

    #[test]
    fn zip_plus_four_is_truncated() {
        assert_eq!(normalize_value(Field::Zip, "80201-1234").as_deref(), Some("80201"));
        assert_eq!(normalize_value(Field::Zip, "802"), None);
    }
}
