//! Shared types, error model, and configuration for leadenrich.
//!
//! This crate is the foundation depended on by all other leadenrich crates.
//! It provides:
//! - [`EnrichError`] — the unified error type
//! - Domain types ([`ContactRecord`], [`Field`], [`LocationCacheEntry`], [`PersistedResult`])
//! - Header alias resolution ([`FieldAliases`], [`HeaderMap`])
//! - Configuration ([`AppConfig`], runtime settings, config loading)

pub mod aliases;
pub mod config;
pub mod error;
pub mod normalize;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use aliases::{FieldAliases, HeaderMap, scalar_text};
pub use config::{
    AppConfig, AuthConfig, PipelineSettings, ProviderAuth, ProviderConfig, ProviderKind,
    ResolverSettings, RetryConfig, StoreSettings, config_dir, config_file_path, env_secret,
    init_config, load_config, load_config_from, validate_config,
};
pub use error::{EnrichError, Result};
pub use types::{
    ContactRecord, Field, FieldSet, FieldValue, INPUT_SOURCE, LocationCacheEntry, LocationTier,
    PersistedResult, PhaseFailure, RunId,
};
