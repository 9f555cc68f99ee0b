//! Core domain types for lead enrichment.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EnrichError;

/// Provenance label for values that came in with the raw record.
pub const INPUT_SOURCE: &str = "input";

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for batch run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Field
// ---------------------------------------------------------------------------

/// A logical contact field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Phone,
    Email,
    City,
    State,
    #[serde(alias = "zipcode")]
    Zip,
    DateOfBirth,
    Age,
    LineType,
    Carrier,
    LinkedinUrl,
    DncStatus,
    Income,
    /// Provider-internal person identifier, consumed by detail lookups.
    PersonId,
}

impl Field {
    /// Every field, in display order.
    pub const ALL: [Field; 14] = [
        Field::Name,
        Field::Phone,
        Field::Email,
        Field::City,
        Field::State,
        Field::Zip,
        Field::DateOfBirth,
        Field::Age,
        Field::LineType,
        Field::Carrier,
        Field::LinkedinUrl,
        Field::DncStatus,
        Field::Income,
        Field::PersonId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Phone => "phone",
            Self::Email => "email",
            Self::City => "city",
            Self::State => "state",
            Self::Zip => "zip",
            Self::DateOfBirth => "date_of_birth",
            Self::Age => "age",
            Self::LineType => "line_type",
            Self::Carrier => "carrier",
            Self::LinkedinUrl => "linkedin_url",
            Self::DncStatus => "dnc_status",
            Self::Income => "income",
            Self::PersonId => "person_id",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = EnrichError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        if wanted == "zipcode" || wanted == "zip_code" {
            return Ok(Self::Zip);
        }
        if wanted == "dob" {
            return Ok(Self::DateOfBirth);
        }
        Field::ALL
            .into_iter()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| EnrichError::validation(format!("unknown field '{s}'")))
    }
}

/// An ordered set of fields, e.g. the `requiredFields` of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSet(pub BTreeSet<Field>);

impl FieldSet {
    pub fn new(fields: impl IntoIterator<Item = Field>) -> Self {
        Self(fields.into_iter().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = Field> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for FieldSet {
    type Err = EnrichError;

    /// Parse a comma-separated list such as `phone,zip`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Field::from_str)
            .collect::<std::result::Result<BTreeSet<_>, _>>()
            .map(Self)
    }
}

// ---------------------------------------------------------------------------
// ContactRecord
// ---------------------------------------------------------------------------

/// One field value plus the phase that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: String,
    /// Phase id, or [`INPUT_SOURCE`] for values from the raw record.
    pub source: String,
}

/// One entry in a record's diagnostic trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseFailure {
    pub phase: String,
    /// [`EnrichError::kind`] label.
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A lead being enriched: fields with provenance plus a failure trail.
///
/// Fields only ever go from empty to non-empty. Once set, a value is never
/// replaced by a later assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactRecord {
    #[serde(default)]
    fields: BTreeMap<Field, FieldValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trail: Vec<PhaseFailure>,
}

impl ContactRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from `(field, value)` pairs tagged with [`INPUT_SOURCE`].
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (Field, &'a str)>) -> Self {
        let mut record = Self::new();
        for (field, value) in pairs {
            record.set_if_empty(field, value, INPUT_SOURCE);
        }
        record
    }

    /// The non-empty value of `field`, if any.
    pub fn get(&self, field: Field) -> Option<&str> {
        self.fields
            .get(&field)
            .map(|v| v.value.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Which phase produced `field`.
    pub fn source_of(&self, field: Field) -> Option<&str> {
        self.fields.get(&field).map(|v| v.source.as_str())
    }

    pub fn has(&self, field: Field) -> bool {
        self.get(field).is_some()
    }

    /// Assign `value` to `field` unless the field is already populated or the
    /// value is blank. Returns whether the record changed.
    pub fn set_if_empty(&mut self, field: Field, value: &str, source: &str) -> bool {
        let value = value.trim();
        if value.is_empty() || self.has(field) {
            return false;
        }
        self.fields.insert(
            field,
            FieldValue {
                value: value.to_string(),
                source: source.to_string(),
            },
        );
        true
    }

    /// Monotonic merge: copy every populated field of `other` that is empty
    /// here, keeping its provenance, and append its trail.
    pub fn merge(&mut self, other: &ContactRecord) {
        for (field, fv) in &other.fields {
            self.set_if_empty(*field, &fv.value, &fv.source);
        }
        self.trail.extend(other.trail.iter().cloned());
    }

    /// Identity key: phone, else email, else name.
    pub fn identity_key(&self) -> Option<String> {
        if let Some(phone) = self.get(Field::Phone) {
            return Some(phone.to_string());
        }
        [Field::Email, Field::Name]
            .into_iter()
            .find_map(|f| self.get(f))
            .map(|v| v.trim().to_lowercase())
    }

    pub fn populated_count(&self) -> usize {
        self.fields.values().filter(|v| !v.value.is_empty()).count()
    }

    /// Whether every field in `required` is populated.
    pub fn satisfies(&self, required: &FieldSet) -> bool {
        required.iter().all(|f| self.has(f))
    }

    /// Required fields that are still empty.
    pub fn missing(&self, required: &FieldSet) -> Vec<Field> {
        required.iter().filter(|f| !self.has(*f)).collect()
    }

    /// Populated fields, in field order.
    pub fn populated(&self) -> impl Iterator<Item = (Field, &str)> {
        self.fields
            .iter()
            .filter(|(_, v)| !v.value.is_empty())
            .map(|(f, v)| (*f, v.value.as_str()))
    }

    /// Append a phase failure to the diagnostic trail.
    pub fn record_failure(&mut self, phase: &str, err: &EnrichError) {
        self.trail.push(PhaseFailure {
            phase: phase.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            at: Utc::now(),
        });
    }
}

// ---------------------------------------------------------------------------
// Location cache
// ---------------------------------------------------------------------------

/// The cascade level that produced a location resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationTier {
    Static,
    Cache,
    Discovered,
    StateFallback,
    Failed,
}

impl LocationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Cache => "cache",
            Self::Discovered => "discovered",
            Self::StateFallback => "state_fallback",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LocationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocationTier {
    type Err = EnrichError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "cache" => Ok(Self::Cache),
            "discovered" => Ok(Self::Discovered),
            "state_fallback" => Ok(Self::StateFallback),
            "failed" => Ok(Self::Failed),
            other => Err(EnrichError::Storage(format!("unknown location tier '{other}'"))),
        }
    }
}

/// A cached location resolution. Negative entries have no id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationCacheEntry {
    /// Lowercase-trimmed query text.
    pub key: String,
    pub id: Option<String>,
    pub full_id: Option<String>,
    /// Tier that originally resolved (or failed to resolve) the text.
    pub tier: LocationTier,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: i64,
}

impl LocationCacheEntry {
    pub fn is_negative(&self) -> bool {
        self.id.is_none()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.ttl_secs)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

// ---------------------------------------------------------------------------
// PersistedResult
// ---------------------------------------------------------------------------

/// One saved record, as written to a run artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedResult {
    pub key: String,
    pub record: ContactRecord,
    pub run_id: RunId,
    pub saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn first_assigned_value_wins() {
        let mut r = ContactRecord::new();
        assert!(r.set_if_empty(Field::Phone, "3035551234", "skip-trace"));
        assert!(!r.set_if_empty(Field::Phone, "7205550000", "people-search"));
        assert_eq!(r.get(Field::Phone), Some("3035551234"));
        assert_eq!(r.source_of(Field::Phone), Some("skip-trace"));
    }

    #[test]
    fn blank_values_never_populate() {
        let mut r = ContactRecord::new();
        assert!(!r.set_if_empty(Field::Email, "   ", "p"));
        assert!(!r.has(Field::Email));
    }

    #[test]
    fn merge_is_monotonic() {
        let mut a = ContactRecord::from_pairs([(Field::Name, "John Doe"), (Field::Zip, "80201")]);
        let b = ContactRecord::from_pairs([(Field::Name, "J. Doe"), (Field::Phone, "3035551234")]);
        let before: Vec<_> = a.populated().map(|(f, v)| (f, v.to_string())).collect();

        a.merge(&b);

        for (field, value) in before {
            assert_eq!(a.get(field), Some(value.as_str()));
        }
        assert_eq!(a.get(Field::Phone), Some("3035551234"));
        assert_eq!(a.get(Field::Name), Some("John Doe"));
    }

    #[test]
    fn merge_with_empty_record_changes_nothing() {
        let mut a = ContactRecord::from_pairs([(Field::Email, "j@example.com")]);
        a.merge(&ContactRecord::new());
        assert_eq!(a.populated_count(), 1);
    }

    #[test]
    fn identity_key_precedence() {
        let r = ContactRecord::from_pairs([(Field::Name, "John Doe"), (Field::Email, "J@X.com")]);
        assert_eq!(r.identity_key().as_deref(), Some("j@x.com"));

        let r = ContactRecord::from_pairs([(Field::Name, " John Doe ")]);
        assert_eq!(r.identity_key().as_deref(), Some("john doe"));

        let r = ContactRecord::from_pairs([(Field::Name, "x"), (Field::Phone, "3035551234")]);
        assert_eq!(r.identity_key().as_deref(), Some("3035551234"));

        assert!(ContactRecord::new().identity_key().is_none());
    }

    #[test]
    fn field_set_parsing() {
        let set: FieldSet = "phone, zipcode".parse().expect("parse");
        assert_eq!(set, FieldSet::new([Field::Phone, Field::Zip]));
        assert!("phone,shoe_size".parse::<FieldSet>().is_err());
    }

    #[test]
    fn missing_and_satisfies() {
        let required = FieldSet::new([Field::Phone, Field::Zip]);
        let r = ContactRecord::from_pairs([(Field::Zip, "80201")]);
        assert!(!r.satisfies(&required));
        assert_eq!(r.missing(&required), vec![Field::Phone]);
    }

    #[test]
    fn record_serialization_keeps_provenance() {
        let mut r = ContactRecord::from_pairs([(Field::Name, "John Doe")]);
        r.set_if_empty(Field::Zip, "80201", "zip-from-city");
        r.record_failure("skip-trace", &EnrichError::transient("HTTP 503"));

        let json = serde_json::to_string(&r).expect("serialize");
        let parsed: ContactRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.source_of(Field::Zip), Some("zip-from-city"));
        assert_eq!(parsed.trail.len(), 1);
        assert_eq!(parsed.trail[0].kind, "transient");
    }

    #[test]
    fn negative_cache_entry_expiry() {
        let created = Utc::now() - Duration::seconds(120);
        let entry = LocationCacheEntry {
            key: "atlantis".into(),
            id: None,
            full_id: None,
            tier: LocationTier::Failed,
            created_at: created,
            ttl_secs: 60,
        };
        assert!(entry.is_negative());
        assert!(entry.is_expired(Utc::now()));
    }
}
