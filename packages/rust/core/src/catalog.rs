//! Build the phase table from configuration.

use std::sync::Arc;

use tracing::debug;

use leadenrich_shared::{AppConfig, EnrichError, Result};

use crate::derive::{AGE_FROM_DOB, AgeFromDob, ZIP_FROM_CITY, ZipFromCity, age_precondition, zip_precondition};
use crate::phase::{Phase, merge_first_non_empty};
use crate::providers::{HttpLookup, ProviderDeps, precondition_for};

/// The built-in phase with id `id`, if there is one.
pub fn builtin_phase(id: &str) -> Option<Phase> {
    match id {
        ZIP_FROM_CITY => Some(Phase {
            id: ZIP_FROM_CITY.into(),
            source: "built-in city/state zip table".into(),
            paid: false,
            precondition: zip_precondition,
            call: Arc::new(ZipFromCity),
            merge: merge_first_non_empty,
        }),
        AGE_FROM_DOB => Some(Phase {
            id: AGE_FROM_DOB.into(),
            source: "date of birth".into(),
            paid: false,
            precondition: age_precondition,
            call: Arc::new(AgeFromDob),
            merge: merge_first_non_empty,
        }),
        _ => None,
    }
}

/// Phases in `[pipeline].phases` order.
///
/// Every id must name a built-in or a `[[providers]]` entry.
pub fn build_phases(config: &AppConfig, deps: &ProviderDeps) -> Result<Vec<Phase>> {
    let mut phases = Vec::with_capacity(config.pipeline.phases.len());
    for id in &config.pipeline.phases {
        if let Some(phase) = builtin_phase(id) {
            phases.push(phase);
            continue;
        }
        let provider = config
            .providers
            .iter()
            .find(|p| &p.name == id)
            .ok_or_else(|| EnrichError::config(format!("unknown phase '{id}'")))?;
        let lookup = HttpLookup::from_config(provider, deps)?;
        phases.push(Phase {
            id: provider.name.clone(),
            source: provider.base_url.clone(),
            paid: true,
            precondition: precondition_for(provider.kind),
            call: Arc::new(lookup),
            merge: merge_first_non_empty,
        });
    }
    debug!(count = phases.len(), "phase table built");
    Ok(phases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use leadenrich_shared::{ProviderAuth, ProviderConfig, ProviderKind};
    use leadenrich_transport::{Retrier, RetryPolicy, build_client};

    fn deps() -> ProviderDeps {
        ProviderDeps {
            client: build_client(Duration::from_secs(1)).expect("client"),
            retrier: Retrier::new(RetryPolicy::single_attempt()),
            tokens: None,
            resolver: None,
        }
    }

    #[test]
    fn default_config_has_builtins_only() {
        let phases = build_phases(&AppConfig::default(), &deps()).unwrap();
        let ids: Vec<_> = phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![ZIP_FROM_CITY, AGE_FROM_DOB]);
        assert!(phases.iter().all(|p| !p.paid));
    }

    #[test]
    fn providers_follow_configured_order() {
        let mut config = AppConfig::default();
        config.providers.push(ProviderConfig {
            name: "tracer".into(),
            kind: ProviderKind::SkipTrace,
            base_url: "https://trace.example.com".into(),
            path: "/v1/search".into(),
            auth: ProviderAuth::None,
            api_key_env: None,
            api_key_header: "x-api-key".into(),
        });
        config.pipeline.phases = vec!["tracer".into(), ZIP_FROM_CITY.into()];

        let phases = build_phases(&config, &deps()).unwrap();
        assert_eq!(phases[0].id, "tracer");
        assert!(phases[0].paid);
        assert_eq!(phases[1].id, ZIP_FROM_CITY);
    }

    #[test]
    fn unknown_phase_is_config_error() {
        let mut config = AppConfig::default();
        config.pipeline.phases.push("mystery".into());
        let err = build_phases(&config, &deps()).unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
