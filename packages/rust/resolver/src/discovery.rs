//! Tier 3: discovery through an external suggestion endpoint.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, instrument};

use leadenrich_shared::{EnrichError, Result};
use leadenrich_transport::{Retrier, check_response, classify_send_error, read_json};

const PROVIDER: &str = "location-discovery";

/// The first run of five or more digits in an id, urn, or URL.
static NUMERIC_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{5,})").expect("valid id regex"));

/// Keys that may hold the suggestion list in an object response.
const LIST_KEYS: [&str; 4] = ["elements", "results", "suggestions", "data"];

/// Keys that may hold an identifier on a suggestion, most specific first.
const ID_KEYS: [&str; 6] = ["targetUrn", "urn", "geoUrn", "id", "trackingUrn", "url"];

/// A location found by discovery, normalised to the internal id format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    /// Bare numeric id.
    pub id: String,
    /// The provider's fully qualified id as returned.
    pub full_id: String,
}

#[async_trait]
pub trait LocationDiscovery: Send + Sync {
    /// `Ok(None)` when the endpoint has no suggestion for `text`.
    async fn discover(&self, text: &str) -> Result<Option<Discovered>>;
}

/// `GET <url>?q=<text>` suggestion endpoint.
pub struct HttpDiscovery {
    client: Client,
    url: String,
    retrier: Retrier,
}

impl HttpDiscovery {
    pub fn new(client: Client, url: impl Into<String>, retrier: Retrier) -> Self {
        Self {
            client,
            url: url.into(),
            retrier,
        }
    }
}

#[async_trait]
impl LocationDiscovery for HttpDiscovery {
    #[instrument(skip_all, fields(text = %text))]
    async fn discover(&self, text: &str) -> Result<Option<Discovered>> {
        let body: Value = match self
            .retrier
            .execute(PROVIDER, || async {
                let response = self
                    .client
                    .get(&self.url)
                    .query(&[("q", text)])
                    .send()
                    .await
                    .map_err(|e| classify_send_error(PROVIDER, e))?;
                let response = check_response(PROVIDER, response).await?;
                read_json::<Value>(PROVIDER, response).await
            })
            .await
        {
            Ok(body) => body,
            Err(EnrichError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let found = first_suggestion(&body).and_then(normalize_suggestion);
        debug!(found = found.is_some(), "discovery response parsed");
        Ok(found)
    }
}

fn first_suggestion(body: &Value) -> Option<&Value> {
    match body {
        Value::Array(items) => items.first(),
        Value::Object(obj) => LIST_KEYS
            .iter()
            .find_map(|k| obj.get(*k))
            .and_then(|list| list.as_array())
            .and_then(|items| items.first()),
        _ => None,
    }
}

/// Map a suggestion to `{id, full_id}`. The bare id is the first long digit
/// run in the first id-bearing field.
pub fn normalize_suggestion(item: &Value) -> Option<Discovered> {
    let raw = match item {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Object(obj) => ID_KEYS.iter().find_map(|k| match obj.get(*k) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })?,
        _ => return None,
    };
    let id = NUMERIC_ID.captures(&raw)?.get(1)?.as_str().to_string();
    Some(Discovered { id, full_id: raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_urn_and_url_forms() {
        let d = normalize_suggestion(&json!({"targetUrn": "urn:li:fs_geo:100809221"})).unwrap();
        assert_eq!(d.id, "100809221");
        assert_eq!(d.full_id, "urn:li:fs_geo:100809221");

        let d = normalize_suggestion(&json!({"url": "https://example.com/locations/100809221/"})).unwrap();
        assert_eq!(d.id, "100809221");

        let d = normalize_suggestion(&json!({"id": 100809221})).unwrap();
        assert_eq!(d.id, "100809221");
    }

    #[test]
    fn short_or_missing_ids_are_rejected() {
        assert!(normalize_suggestion(&json!({"id": "12"})).is_none());
        assert!(normalize_suggestion(&json!({"name": "Maryland"})).is_none());
    }

    #[test]
    fn suggestion_list_shapes() {
        assert!(first_suggestion(&json!([{"id": "100809221"}])).is_some());
        assert!(first_suggestion(&json!({"elements": [{"id": "100809221"}]})).is_some());
        assert!(first_suggestion(&json!({"elements": []})).is_none());
        assert!(first_suggestion(&json!("nope")).is_none());
    }
}
