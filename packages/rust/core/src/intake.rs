//! Raw record intake: JSON objects → validated [`ContactRecord`]s.
//!
//! Headers are resolved against the input alias table once per batch; every
//! record is then mapped through the same [`HeaderMap`](leadenrich_shared::HeaderMap).

use serde_json::Value;
use tracing::{debug, warn};

use leadenrich_shared::{ContactRecord, EnrichError, FieldAliases, INPUT_SOURCE, Result};

/// A raw record that never entered the pipeline.
#[derive(Debug)]
pub struct RejectedRecord {
    /// Position in the input batch.
    pub index: usize,
    pub error: EnrichError,
}

/// Accepted records (with their input position) and rejections.
#[derive(Debug, Default)]
pub struct Intake {
    pub records: Vec<(usize, ContactRecord)>,
    pub rejected: Vec<RejectedRecord>,
}

/// Parse input text as a JSON array or JSON lines.
pub fn parse_input(text: &str) -> Result<Vec<Value>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| EnrichError::validation(format!("input is not a JSON array: {e}")));
    }
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .map_err(|e| EnrichError::validation(format!("line {}: {e}", n + 1)))
        })
        .collect()
}

/// Map a batch of raw JSON values into records.
pub fn intake_batch(raw: &[Value]) -> Intake {
    let mut headers: Vec<&str> = Vec::new();
    for obj in raw.iter().filter_map(Value::as_object) {
        for key in obj.keys() {
            if !headers.contains(&key.as_str()) {
                headers.push(key);
            }
        }
    }
    let map = FieldAliases::input().resolve(headers.iter().copied());
    debug!(headers = headers.len(), "input headers resolved");

    let mut intake = Intake::default();
    for (index, value) in raw.iter().enumerate() {
        let Some(obj) = value.as_object() else {
            intake.rejected.push(RejectedRecord {
                index,
                error: EnrichError::validation("record is not a JSON object"),
            });
            continue;
        };
        let record = map.to_record(obj, INPUT_SOURCE);
        if record.identity_key().is_none() {
            warn!(index, "record has no phone, email or name; rejected");
            intake.rejected.push(RejectedRecord {
                index,
                error: EnrichError::validation("record has no phone, email or name"),
            });
            continue;
        }
        intake.records.push((index, record));
    }
    intake
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadenrich_shared::Field;
    use serde_json::json;

    #[test]
    fn accepts_arrays_and_json_lines() {
        let array = parse_input(r#"[{"name": "A"}, {"name": "B"}]"#).unwrap();
        assert_eq!(array.len(), 2);

        let lines = parse_input("{\"name\": \"A\"}\n\n{\"name\": \"B\"}\n").unwrap();
        assert_eq!(lines.len(), 2);

        let err = parse_input("{\"name\": \"A\"}\nnot json").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn maps_header_variants_and_normalises() {
        let raw = vec![
            json!({"Full Name": "John Doe", "Phone Number": "+1 (303) 555-1234", "State": "Colorado"}),
            json!({"Full Name": "Jane Roe", "E-Mail": "JANE@EXAMPLE.COM"}),
        ];
        let intake = intake_batch(&raw);
        assert!(intake.rejected.is_empty());

        let (_, john) = &intake.records[0];
        assert_eq!(john.get(Field::Phone), Some("3035551234"));
        assert_eq!(john.get(Field::State), Some("CO"));
        assert_eq!(john.source_of(Field::Name), Some(INPUT_SOURCE));

        let (_, jane) = &intake.records[1];
        assert_eq!(jane.get(Field::Email), Some("jane@example.com"));
    }

    #[test]
    fn records_with_different_spellings_keep_their_values() {
        let raw = vec![
            json!({"name": "John Doe", "phone": "303-555-1234"}),
            json!({"mobile": "720-555-0000", "email": "jane@example.com"}),
            json!({"cell": "720-555-9999"}),
        ];
        let intake = intake_batch(&raw);
        assert!(intake.rejected.is_empty());
        assert_eq!(intake.records.len(), 3);

        let phones: Vec<_> = intake
            .records
            .iter()
            .map(|(_, r)| r.get(Field::Phone).map(str::to_string))
            .collect();
        assert_eq!(
            phones,
            vec![
                Some("3035551234".to_string()),
                Some("7205550000".to_string()),
                Some("7205559999".to_string()),
            ]
        );
        assert_eq!(intake.records[1].1.get(Field::Email), Some("jane@example.com"));
    }

    #[test]
    fn rejects_records_without_identity() {
        let raw = vec![json!({"city": "Denver"}), json!("just text"), json!({"name": "Ok"})];
        let intake = intake_batch(&raw);
        assert_eq!(intake.records.len(), 1);
        let indices: Vec<_> = intake.rejected.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert!(intake.rejected.iter().all(|r| r.error.kind() == "validation"));
    }
}
