//! Tier 1: built-in location ids for common metros and states.

use std::collections::HashMap;
use std::sync::LazyLock;

/// `(query key, provider id)`. Keys are already normalised.
const LOCATIONS: &[(&str, &str)] = &[
    // country
    ("united states", "103644278"),
    ("usa", "103644278"),
    // metros
    ("new york", "90000070"),
    ("new york city", "90000070"),
    ("nyc", "90000070"),
    ("new york, ny", "90000070"),
    ("san francisco", "90000084"),
    ("san francisco bay area", "90000084"),
    ("san francisco, ca", "90000084"),
    ("los angeles", "90000049"),
    ("los angeles, ca", "90000049"),
    ("chicago", "90000014"),
    ("chicago, il", "90000014"),
    ("boston", "90000007"),
    ("boston, ma", "90000007"),
    ("seattle", "90000091"),
    ("seattle, wa", "90000091"),
    ("denver", "90000052"),
    ("denver, co", "90000052"),
    ("dallas", "90000031"),
    ("dallas, tx", "90000031"),
    ("austin", "90000064"),
    ("austin, tx", "90000064"),
    ("miami", "90000056"),
    ("miami, fl", "90000056"),
    // states
    ("california", "102095887"),
    ("texas", "102748797"),
    ("new york state", "105080838"),
    ("florida", "101318387"),
    ("colorado", "105763813"),
    ("illinois", "101949407"),
    ("washington", "103977389"),
    ("massachusetts", "101098412"),
    ("georgia", "103950076"),
    ("arizona", "106032500"),
];

static TABLE: LazyLock<HashMap<&'static str, &'static str>> =
    LazyLock::new(|| LOCATIONS.iter().copied().collect());

/// The provider id for a normalised key, if it is in the built-in table.
pub fn lookup(key: &str) -> Option<&'static str> {
    TABLE.get(key).copied()
}
