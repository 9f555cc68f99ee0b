//! Header-name aliases for logical fields.
//!
//! Each [`Field`] has an explicit, ordered list of header spellings. A batch
//! resolves its headers against the list once ([`HeaderMap::resolve`]) and
//! then maps every record through the resulting table.

use serde_json::{Map, Value};

use crate::normalize::normalize_value;
use crate::types::{ContactRecord, Field};

/// Ordered alias lists, most specific spelling first.
#[derive(Debug, Clone)]
pub struct FieldAliases {
    entries: Vec<(Field, Vec<&'static str>)>,
}

impl FieldAliases {
    /// Aliases for raw input columns (spreadsheets, CRM exports).
    pub fn input() -> Self {
        Self {
            entries: vec![
                (Field::Name, vec!["name", "full_name", "fullname", "contact_name", "lead_name", "contact"]),
                (Field::Phone, vec!["phone", "phone_number", "mobile", "mobile_phone", "cell", "cell_phone", "telephone", "tel"]),
                (Field::Email, vec!["email", "email_address", "e_mail", "mail"]),
                (Field::City, vec!["city", "town", "locality"]),
                (Field::State, vec!["state", "state_code", "province", "region"]),
                (Field::Zip, vec!["zip", "zipcode", "zip_code", "postal_code", "postcode", "postal"]),
                (Field::DateOfBirth, vec!["date_of_birth", "dob", "birth_date", "birthdate", "birthday"]),
                (Field::Age, vec!["age"]),
                (Field::LineType, vec!["line_type", "phone_type"]),
                (Field::Carrier, vec!["carrier", "phone_carrier", "carrier_name"]),
                (Field::LinkedinUrl, vec!["linkedin_url", "linkedin", "linkedin_profile"]),
                (Field::DncStatus, vec!["dnc_status", "dnc", "do_not_call"]),
                (Field::Income, vec!["income", "household_income", "median_income"]),
            ],
        }
    }

    /// Aliases for provider response objects. Adds provider id spellings.
    pub fn provider() -> Self {
        let mut aliases = Self::input();
        aliases.entries.push((
            Field::PersonId,
            vec!["person_id", "personid", "tahoe_id", "profile_id", "id"],
        ));
        for (field, list) in &mut aliases.entries {
            match field {
                Field::Phone => list.extend(["phones", "phone_numbers"]),
                Field::Email => list.extend(["emails", "email_addresses"]),
                Field::LineType => list.push("type"),
                Field::LinkedinUrl => list.extend(["profile_url", "public_profile_url"]),
                Field::DncStatus => list.push("status"),
                _ => {}
            }
        }
        aliases
    }

    /// Resolve a set of header names into a stable header → field table.
    pub fn resolve<'a>(&self, headers: impl IntoIterator<Item = &'a str>) -> HeaderMap {
        let headers: Vec<(String, String)> = headers
            .into_iter()
            .map(|h| (h.to_string(), canonical(h)))
            .collect();

        let mut columns = Vec::new();
        for (field, aliases) in &self.entries {
            let mut matched: Vec<String> = Vec::new();
            for alias in aliases {
                let alias = canonical(alias);
                for (header, _) in headers.iter().filter(|(_, c)| *c == alias) {
                    if !matched.contains(header) {
                        matched.push(header.clone());
                    }
                }
            }
            if !matched.is_empty() {
                columns.push((*field, matched));
            }
        }

        let find = |names: &[&str]| {
            names.iter().find_map(|n| {
                let n = canonical(n);
                headers.iter().find(|(_, c)| *c == n).map(|(h, _)| h.clone())
            })
        };
        let split_name = match (
            find(&["first_name", "firstname", "given_name"]),
            find(&["last_name", "lastname", "surname", "family_name"]),
        ) {
            (Some(first), Some(last)) => Some((first, last)),
            _ => None,
        };

        HeaderMap {
            columns,
            split_name,
        }
    }
}

/// Lowercase and strip everything but letters and digits, so that
/// `Phone Number`, `phone_number` and `phoneNumber` compare equal.
fn canonical(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A resolved header → field table for one batch.
///
/// Every header matching a field is kept, in alias order, since records in
/// one batch may spell the same column differently.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    columns: Vec<(Field, Vec<String>)>,
    /// First/last-name columns, used when no full-name column exists.
    split_name: Option<(String, String)>,
}

impl HeaderMap {
    /// The preferred header mapped to `field`, if any.
    pub fn header_for(&self, field: Field) -> Option<&str> {
        self.headers_for(field).first().map(String::as_str)
    }

    /// Every header mapped to `field`, most preferred first.
    pub fn headers_for(&self, field: Field) -> &[String] {
        self.columns
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, headers)| headers.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.split_name.is_none()
    }

    /// Extract `(field, normalised value)` pairs from a JSON object.
    ///
    /// For each field the first mapped header holding a usable value in
    /// this record wins.
    pub fn extract(&self, raw: &Map<String, Value>) -> Vec<(Field, String)> {
        let mut out = Vec::new();
        for (field, headers) in &self.columns {
            let value = headers.iter().find_map(|header| {
                raw.get(header)
                    .and_then(scalar_text)
                    .and_then(|text| normalize_value(*field, &text))
            });
            if let Some(v) = value {
                out.push((*field, v));
            }
        }
        if !out.iter().any(|(f, _)| *f == Field::Name) {
            if let Some((first, last)) = &self.split_name {
                let joined = [first, last]
                    .iter()
                    .filter_map(|h| raw.get(h.as_str()).and_then(scalar_text))
                    .collect::<Vec<_>>()
                    .join(" ");
                if !joined.trim().is_empty() {
                    out.push((Field::Name, joined.trim().to_string()));
                }
            }
        }
        out
    }

    /// Map a JSON object into a record whose fields carry `source`.
    pub fn to_record(&self, raw: &Map<String, Value>, source: &str) -> ContactRecord {
        let mut record = ContactRecord::new();
        for (field, value) in self.extract(raw) {
            record.set_if_empty(field, &value, source);
        }
        record
    }
}

/// Text form of a JSON scalar; for arrays, the first usable element.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => items.iter().find_map(scalar_text),
        Value::Object(obj) => ["number", "value", "address", "url"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(scalar_text)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(v: Value) -> Map<String, Value> {
        v.as_object().cloned().expect("object")
    }

    #[test]
    fn resolves_header_variants() {
        let map = FieldAliases::input().resolve(["Full Name", "Phone Number", "E-Mail", "Zip Code"]);
        assert_eq!(map.header_for(Field::Name), Some("Full Name"));
        assert_eq!(map.header_for(Field::Phone), Some("Phone Number"));
        assert_eq!(map.header_for(Field::Email), Some("E-Mail"));
        assert_eq!(map.header_for(Field::Zip), Some("Zip Code"));
    }

    #[test]
    fn alias_order_decides_between_competing_headers() {
        let map = FieldAliases::input().resolve(["cell", "phone"]);
        assert_eq!(map.header_for(Field::Phone), Some("phone"));
    }

    #[test]
    fn mixed_spellings_fall_back_per_record() {
        let map = FieldAliases::input().resolve(["phone", "mobile", "cell", "name"]);
        assert_eq!(map.headers_for(Field::Phone), ["phone", "mobile", "cell"]);

        let mobile_only = object(json!({"mobile": "720-555-0000"}));
        assert_eq!(
            map.to_record(&mobile_only, "input").get(Field::Phone),
            Some("7205550000")
        );

        let bad_primary = object(json!({"phone": "n/a", "cell": "(720) 555-9999"}));
        assert_eq!(
            map.to_record(&bad_primary, "input").get(Field::Phone),
            Some("7205559999")
        );
    }

    #[test]
    fn input_aliases_do_not_map_bare_id() {
        let map = FieldAliases::input().resolve(["id", "name"]);
        assert_eq!(map.header_for(Field::PersonId), None);
        let map = FieldAliases::provider().resolve(["id", "name"]);
        assert_eq!(map.header_for(Field::PersonId), Some("id"));
    }

    #[test]
    fn extracts_and_normalizes() {
        let raw = object(json!({
            "Name": "John Doe",
            "Phone": "(303) 555-1234",
            "State": "Colorado",
            "zip": 80201
        }));
        let headers: Vec<&str> = raw.keys().map(String::as_str).collect();
        let map = FieldAliases::input().resolve(headers);
        let record = map.to_record(&raw, "input");
        assert_eq!(record.get(Field::Phone), Some("3035551234"));
        assert_eq!(record.get(Field::State), Some("CO"));
        assert_eq!(record.get(Field::Zip), Some("80201"));
    }

    #[test]
    fn joins_first_and_last_name() {
        let raw = object(json!({"First Name": "Jane", "Last Name": "Roe"}));
        let headers: Vec<&str> = raw.keys().map(String::as_str).collect();
        let record = FieldAliases::input().resolve(headers).to_record(&raw, "input");
        assert_eq!(record.get(Field::Name), Some("Jane Roe"));
    }

    #[test]
    fn scalar_text_takes_first_array_element() {
        let v = json!([{"number": "3035551234"}, {"number": "7205550000"}]);
        assert_eq!(scalar_text(&v).as_deref(), Some("3035551234"));
    }
}
