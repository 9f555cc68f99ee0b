//! HTTP lookup providers.
//!
//! Every provider kind is the same client with a different request shape,
//! precondition and declared output fields. Responses are mapped through the
//! provider alias table and only the declared fields are kept.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use leadenrich_resolver::{LocationResolver, retain_matching_location};
use leadenrich_shared::{
    ContactRecord, EnrichError, Field, FieldAliases, ProviderAuth, ProviderConfig, ProviderKind,
    Result, env_secret,
};
use leadenrich_transport::{Retrier, TokenSource, check_response, classify_send_error, read_json};

use crate::phase::{PhaseCall, PhaseContext, Precondition};

/// Keys under which a search response may hold its candidate list.
const LIST_KEYS: [&str; 4] = ["results", "data", "candidates", "people"];

/// Keys that may hold a candidate's free-text location.
const LOCATION_KEYS: [&str; 6] = ["location", "location_name", "locationName", "address", "city", "region"];

// ---------------------------------------------------------------------------
// Kind metadata
// ---------------------------------------------------------------------------

/// Fields a provider kind is allowed to contribute.
pub fn declared_fields(kind: ProviderKind) -> &'static [Field] {
    match kind {
        ProviderKind::SkipTrace => &[
            Field::Phone,
            Field::Email,
            Field::DateOfBirth,
            Field::Age,
            Field::PersonId,
        ],
        ProviderKind::PeopleSearch => &[Field::Phone, Field::Email, Field::Age, Field::PersonId],
        ProviderKind::PersonDetail => &[Field::Phone, Field::Email, Field::DateOfBirth, Field::Age],
        ProviderKind::CarrierLookup => &[Field::Carrier, Field::LineType],
        ProviderKind::DncStatus => &[Field::DncStatus],
        ProviderKind::IncomeByZip => &[Field::Income],
        ProviderKind::SocialProfile => &[Field::LinkedinUrl],
    }
}

/// The precondition a provider kind runs under.
pub fn precondition_for(kind: ProviderKind) -> Precondition {
    match kind {
        ProviderKind::SkipTrace => |r| {
            r.has(Field::Name) && ((r.has(Field::City) && r.has(Field::State)) || r.has(Field::Zip))
        },
        ProviderKind::PeopleSearch => |r| r.has(Field::Name),
        ProviderKind::PersonDetail => |r| r.has(Field::PersonId),
        ProviderKind::CarrierLookup => {
            |r| r.has(Field::Phone) && !(r.has(Field::Carrier) && r.has(Field::LineType))
        }
        ProviderKind::DncStatus => |r| r.has(Field::Phone) && !r.has(Field::DncStatus),
        ProviderKind::IncomeByZip => |r| r.has(Field::Zip) && !r.has(Field::Income),
        ProviderKind::SocialProfile => |r| r.has(Field::Name) && !r.has(Field::LinkedinUrl),
    }
}

fn kind_label(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::SkipTrace => "skip-trace",
        ProviderKind::PeopleSearch => "people-search",
        ProviderKind::PersonDetail => "person-detail",
        ProviderKind::CarrierLookup => "carrier-lookup",
        ProviderKind::DncStatus => "dnc-status",
        ProviderKind::IncomeByZip => "income-by-zip",
        ProviderKind::SocialProfile => "social-profile",
    }
}

fn is_search(kind: ProviderKind) -> bool {
    matches!(
        kind,
        ProviderKind::SkipTrace | ProviderKind::PeopleSearch | ProviderKind::SocialProfile
    )
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Request {
    Get { url: String, query: Vec<(&'static str, String)> },
    Post { url: String, body: Value },
}

/// Request plus the location text results must be filtered against, when
/// the location could not be resolved to an id.
struct Prepared {
    request: Request,
    filter_location: Option<String>,
}

/// How a provider authenticates its calls.
#[derive(Clone)]
pub enum AuthMode {
    None,
    ApiKey { header: String, value: String },
    Bearer(Arc<dyn TokenSource>),
}

/// Shared collaborators for building providers.
#[derive(Clone)]
pub struct ProviderDeps {
    pub client: Client,
    pub retrier: Retrier,
    pub tokens: Option<Arc<dyn TokenSource>>,
    pub resolver: Option<Arc<LocationResolver>>,
}

// ---------------------------------------------------------------------------
// HttpLookup
// ---------------------------------------------------------------------------

/// One configured lookup provider.
pub struct HttpLookup {
    name: String,
    kind: ProviderKind,
    url: String,
    auth: AuthMode,
    client: Client,
    retrier: Retrier,
    resolver: Option<Arc<LocationResolver>>,
    aliases: FieldAliases,
}

impl HttpLookup {
    pub fn from_config(config: &ProviderConfig, deps: &ProviderDeps) -> Result<Self> {
        let auth = match config.auth {
            ProviderAuth::None => AuthMode::None,
            ProviderAuth::ApiKey => {
                let var = config.api_key_env.as_deref().ok_or_else(|| {
                    EnrichError::config(format!("provider '{}' sets no api_key_env", config.name))
                })?;
                let value = env_secret(var).ok_or_else(|| {
                    EnrichError::config(format!(
                        "provider '{}': environment variable {var} is not set",
                        config.name
                    ))
                })?;
                AuthMode::ApiKey {
                    header: config.api_key_header.clone(),
                    value,
                }
            }
            ProviderAuth::Bearer => AuthMode::Bearer(deps.tokens.clone().ok_or_else(|| {
                EnrichError::config(format!(
                    "provider '{}' uses bearer auth but no token source is configured",
                    config.name
                ))
            })?),
        };

        Ok(Self {
            name: config.name.clone(),
            kind: config.kind,
            url: format!("{}{}", config.base_url.trim_end_matches('/'), config.path),
            auth,
            client: deps.client.clone(),
            retrier: deps.retrier.clone(),
            resolver: deps.resolver.clone(),
            aliases: FieldAliases::provider(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn prepare(&self, record: &ContactRecord, ctx: &PhaseContext) -> Result<Prepared> {
        let field = |f: Field| record.get(f).unwrap_or_default().to_string();
        let get = |name: &'static str, f: Field| Prepared {
            request: Request::Get {
                url: self.url.clone(),
                query: vec![(name, field(f))],
            },
            filter_location: None,
        };

        let prepared = match self.kind {
            ProviderKind::SkipTrace => {
                let mut body = Map::new();
                for (key, f) in [
                    ("name", Field::Name),
                    ("city", Field::City),
                    ("state", Field::State),
                    ("zip", Field::Zip),
                ] {
                    if let Some(v) = record.get(f) {
                        body.insert(key.into(), Value::String(v.to_string()));
                    }
                }
                Prepared {
                    request: Request::Post {
                        url: self.url.clone(),
                        body: Value::Object(body),
                    },
                    filter_location: None,
                }
            }
            ProviderKind::PeopleSearch | ProviderKind::SocialProfile => {
                let id_key = if self.kind == ProviderKind::PeopleSearch {
                    "location_id"
                } else {
                    "geo_id"
                };
                let mut body = Map::new();
                body.insert("name".into(), Value::String(field(Field::Name)));
                let mut filter_location = None;
                if let Some(text) = location_text(record) {
                    let resolved = match &self.resolver {
                        Some(resolver) => Some(resolver.resolve_in(&ctx.locations, &text).await),
                        None => None,
                    };
                    match resolved.and_then(|r| r.id) {
                        Some(id) => {
                            body.insert(id_key.into(), Value::String(id));
                        }
                        None => {
                            debug!(provider = %self.name, %text, "location unresolved; keyword search");
                            body.insert("keywords".into(), Value::String(text.clone()));
                            filter_location = Some(text);
                        }
                    }
                }
                Prepared {
                    request: Request::Post {
                        url: self.url.clone(),
                        body: Value::Object(body),
                    },
                    filter_location,
                }
            }
            ProviderKind::PersonDetail => {
                let id: String =
                    url::form_urlencoded::byte_serialize(field(Field::PersonId).as_bytes()).collect();
                Prepared {
                    request: Request::Get {
                        url: format!("{}/{id}", self.url.trim_end_matches('/')),
                        query: Vec::new(),
                    },
                    filter_location: None,
                }
            }
            ProviderKind::CarrierLookup | ProviderKind::DncStatus => get("phone", Field::Phone),
            ProviderKind::IncomeByZip => get("zip", Field::Zip),
        };
        Ok(prepared)
    }

    async fn send(&self, request: &Request, token: Option<&str>) -> Result<Value> {
        let builder = match request {
            Request::Get { url, query } => self.client.get(url).query(query),
            Request::Post { url, body } => self.client.post(url).json(body),
        };
        let builder = match (&self.auth, token) {
            (AuthMode::ApiKey { header, value }, _) => builder.header(header.as_str(), value.as_str()),
            (AuthMode::Bearer(_), Some(token)) => builder.bearer_auth(token),
            _ => builder,
        };
        let response = builder
            .send()
            .await
            .map_err(|e| classify_send_error(&self.name, e))?;
        let response = check_response(&self.name, response).await?;
        read_json::<Value>(&self.name, response).await
    }

    async fn execute(&self, request: &Request) -> Result<Value> {
        match &self.auth {
            AuthMode::Bearer(tokens) => {
                self.retrier
                    .execute_authenticated(&self.name, tokens.as_ref(), |token| async move {
                        self.send(request, Some(&token)).await
                    })
                    .await
            }
            _ => self.retrier.execute(&self.name, || self.send(request, None)).await,
        }
    }

    /// Map a response to a partial record holding only declared fields.
    fn extract(&self, candidate: &Map<String, Value>) -> ContactRecord {
        let declared = declared_fields(self.kind);
        let headers = self.aliases.resolve(candidate.keys().map(String::as_str));
        let mut out = ContactRecord::new();
        for (field, value) in headers.extract(candidate) {
            if declared.contains(&field) {
                out.set_if_empty(field, &value, &self.name);
            }
        }
        out
    }
}

#[async_trait]
impl PhaseCall for HttpLookup {
    #[instrument(skip_all, fields(provider = %self.name, kind = kind_label(self.kind)))]
    async fn call(&self, record: &ContactRecord, ctx: &PhaseContext) -> Result<ContactRecord> {
        let prepared = self.prepare(record, ctx).await?;
        let body = self.execute(&prepared.request).await?;

        let candidate = if is_search(self.kind) {
            let mut candidates = candidate_list(&body);
            if let Some(requested) = &prepared.filter_location {
                let removed = retain_matching_location(&mut candidates, requested, candidate_location);
                debug!(removed, kept = candidates.len(), "post-filtered by location");
            }
            candidates
                .into_iter()
                .next()
                .ok_or_else(|| EnrichError::not_found(format!("{}: no matching candidates", self.name)))?
        } else {
            single_object(&body)
                .ok_or_else(|| EnrichError::transient(format!("{}: unexpected response shape", self.name)))?
        };

        let found = self.extract(&candidate);
        debug!(fields = found.populated_count(), "provider response mapped");
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

/// `City, ST`, or just the state, for location-aware searches.
fn location_text(record: &ContactRecord) -> Option<String> {
    match (record.get(Field::City), record.get(Field::State)) {
        (Some(city), Some(state)) => Some(format!("{city}, {state}")),
        (None, Some(state)) => Some(state.to_string()),
        (Some(city), None) => Some(city.to_string()),
        (None, None) => None,
    }
}

/// Candidate objects from a search response: a bare array, an object
/// holding one under a list key, or a single object.
fn candidate_list(body: &Value) -> Vec<Map<String, Value>> {
    let list = match body {
        Value::Array(items) => items,
        Value::Object(obj) => match LIST_KEYS.iter().find_map(|k| obj.get(*k).and_then(Value::as_array)) {
            Some(items) => items,
            None => return vec![obj.clone()],
        },
        _ => return Vec::new(),
    };
    list.iter().filter_map(|v| v.as_object().cloned()).collect()
}

/// The object a lookup response describes, unwrapping `data`/`result`.
fn single_object(body: &Value) -> Option<Map<String, Value>> {
    let obj = body.as_object()?;
    for key in ["data", "result"] {
        if let Some(inner) = obj.get(key).and_then(Value::as_object) {
            return Some(inner.clone());
        }
    }
    Some(obj.clone())
}

fn candidate_location(candidate: &Map<String, Value>) -> Option<String> {
    LOCATION_KEYS.iter().find_map(|k| match candidate.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(obj) => {
            let parts: Vec<&str> = obj.values().filter_map(Value::as_str).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    })
}
