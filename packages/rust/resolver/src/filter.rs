//! Post-hoc location filtering for keyword-based searches.
//!
//! When resolution fails, a search runs with the location as a plain keyword
//! and every result must then be checked against the requested text.

/// Case-insensitive substring match of a result's free-text location against
/// the requested text. Only the leading segment of the request (the part
/// before the first comma) has to appear, so `Denver, CO` matches
/// `Denver, Colorado, United States`.
pub fn location_matches(candidate: &str, requested: &str) -> bool {
    let candidate = candidate.trim().to_lowercase();
    let requested = requested.trim().to_lowercase();
    if candidate.is_empty() || requested.is_empty() {
        return false;
    }
    if candidate.contains(&requested) {
        return true;
    }
    let primary = requested.split(',').next().unwrap_or_default().trim();
    !primary.is_empty() && candidate.contains(primary)
}

/// Keep only the items whose location matches `requested`. Items without a
/// location are dropped. Returns the number removed.
pub fn retain_matching_location<T>(
    items: &mut Vec<T>,
    requested: &str,
    location_of: impl Fn(&T) -> Option<String>,
) -> usize {
    let before = items.len();
    items.retain(|item| {
        location_of(item)
            .map(|loc| location_matches(&loc, requested))
            .unwrap_or(false)
    });
    before - items.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_case_insensitively() {
        assert!(location_matches("DENVER, Colorado", "denver"));
        assert!(location_matches("Denver, Colorado, United States", "Denver, CO"));
        assert!(!location_matches("Boulder, Colorado", "Denver, CO"));
        assert!(!location_matches("", "Denver"));
    }

    #[test]
    fn drops_non_matching_and_unlocated_items() {
        let mut items = vec![
            ("a", Some("Annapolis, Maryland")),
            ("b", Some("Austin, Texas")),
            ("c", None),
        ];
        let removed = retain_matching_location(&mut items, "Maryland", |i| i.1.map(String::from));
        assert_eq!(removed, 2);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, "a");
    }
}
