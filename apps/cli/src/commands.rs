//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use tracing::{info, warn};

use leadenrich_auth::{CredentialBroker, broker_from_config};
use leadenrich_core::{
    BatchReport, BatchRunner, CancelFlag, EnrichmentPipeline, ProviderDeps, build_phases,
    parse_input,
};
use leadenrich_resolver::{HttpDiscovery, LocationDiscovery, LocationResolver};
use leadenrich_shared::{
    AppConfig, FieldSet, PipelineSettings, RunId, StoreSettings, init_config, load_config,
    load_config_from,
};
use leadenrich_storage::{BlobStore, FsBlobStore, ResultStore, Storage};
use leadenrich_transport::{Retrier, RetryPolicy, TokenSource, build_client};

use crate::progress::CliProgress;

/// Blob key of the aggregate written after each `enrich`.
const AGGREGATE_KEY: &str = "aggregate.json";

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// leadenrich: fill in missing lead fields with as few paid lookups as possible.
#[derive(Parser)]
#[command(
    name = "leadenrich",
    version,
    about = "Enrich partial contact records through a phased lookup pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.leadenrich/leadenrich.toml.
    #[arg(long, global = true, env = "LEADENRICH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Enrich a batch of records and persist the results.
    Enrich {
        /// Input file: a JSON array of objects, or JSON lines.
        #[arg(short, long)]
        input: PathBuf,

        /// Fields that end a record's pipeline once populated (comma-separated).
        #[arg(short, long)]
        required: Option<String>,

        /// Records enriched in parallel.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Bearer token used as-is instead of the broker's sources.
        #[arg(long, env = "LEADENRICH_TOKEN_OVERRIDE", hide_env_values = true)]
        token: Option<String>,

        /// Write the batch report as JSON to this file.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Merge every saved run into one deduplicated list.
    Aggregate {
        /// Output file (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Resolve a free-text location to a provider id.
    Resolve {
        /// Location text, e.g. "Denver, CO".
        text: String,
    },

    /// Obtain a bearer token from the configured credential sources.
    Token {
        /// Skip the cached token.
        #[arg(long)]
        force: bool,

        /// Print the full token instead of a masked prefix.
        #[arg(long)]
        reveal: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "leadenrich=info",
        1 => "leadenrich=debug",
        _ => "leadenrich=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Enrich {
            input,
            required,
            workers,
            token,
            report,
        } => {
            cmd_enrich(
                config_path,
                &input,
                required.as_deref(),
                workers,
                token,
                report.as_deref(),
            )
            .await
        }
        Command::Aggregate { out } => cmd_aggregate(config_path, out.as_deref()).await,
        Command::Resolve { text } => cmd_resolve(config_path, &text).await,
        Command::Token { force, reveal } => cmd_token(config_path, force, reveal).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    Ok(match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

/// Expand a leading `~` to the home directory.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ if path == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(path)),
        _ => PathBuf::from(path),
    }
}

fn output_root(config: &AppConfig) -> PathBuf {
    expand_home(&config.defaults.output_dir)
}

fn blob_store(config: &AppConfig) -> Arc<dyn BlobStore> {
    Arc::new(FsBlobStore::new(output_root(config), StoreSettings::from(config)))
}

/// Open the location cache and drop expired rows.
async fn open_location_cache(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = match &config.resolver.cache_db {
        Some(p) => expand_home(p),
        None => output_root(config).join("cache").join("locations.db"),
    };
    let storage = Storage::open(&path).await?;
    let purged = storage.purge_expired_locations(Utc::now()).await?;
    if purged > 0 {
        info!(purged, "expired location cache entries removed");
    }
    Ok(Arc::new(storage))
}

async fn build_resolver(config: &AppConfig, client: &reqwest::Client, retrier: &Retrier) -> Result<LocationResolver> {
    let cache = open_location_cache(config).await?;
    let discovery = config.resolver.discovery_url.as_ref().map(|url| {
        Arc::new(HttpDiscovery::new(client.clone(), url.clone(), retrier.clone())) as Arc<dyn LocationDiscovery>
    });
    if discovery.is_none() {
        info!("no discovery endpoint configured; resolving from table and cache only");
    }
    Ok(LocationResolver::new(cache, discovery, config.into()))
}

fn build_broker(config: &AppConfig, override_token: Option<String>, client: &reqwest::Client, retrier: &Retrier) -> CredentialBroker {
    broker_from_config(config, override_token, client.clone(), retrier.clone())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_enrich(
    config_path: Option<&Path>,
    input: &Path,
    required: Option<&str>,
    workers: Option<usize>,
    token: Option<String>,
    report_path: Option<&Path>,
) -> Result<()> {
    let config = load(config_path)?;
    let mut settings = PipelineSettings::try_from(&config)?;
    if let Some(required) = required {
        settings.required = required.parse::<FieldSet>()?;
    }
    if let Some(workers) = workers {
        settings.workers = workers.max(1);
    }

    let text = std::fs::read_to_string(input)
        .map_err(|e| eyre!("cannot read input '{}': {e}", input.display()))?;
    let raw = parse_input(&text)?;
    if raw.is_empty() {
        return Err(eyre!("input '{}' holds no records", input.display()));
    }

    let client = build_client(settings.call_timeout)?;
    let retrier = Retrier::new(RetryPolicy::from(&config));
    let broker: Arc<dyn TokenSource> = Arc::new(build_broker(&config, token, &client, &retrier));
    let resolver = Arc::new(build_resolver(&config, &client, &retrier).await?);
    let deps = ProviderDeps {
        client,
        retrier,
        tokens: Some(broker),
        resolver: Some(resolver),
    };
    let pipeline = EnrichmentPipeline::new(build_phases(&config, &deps)?);

    let blobs = blob_store(&config);
    let store = ResultStore::new(Arc::clone(&blobs), RunId::new());
    let runner = BatchRunner::new(pipeline, store.clone(), settings.workers, settings.required.clone());

    info!(
        input = %input.display(),
        records = raw.len(),
        workers = settings.workers,
        run_id = %store.run_id(),
        "enriching"
    );

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; saving records in flight");
                cancel.cancel();
            }
        });
    }

    let progress = Arc::new(CliProgress::new(raw.len()));
    let report = runner.run(&raw, cancel, progress.clone()).await;
    progress.finish();

    print_report(&report);

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).map_err(|e| eyre!("cannot write report '{}': {e}", path.display()))?;
        println!("  Report:    {}", path.display());
    }

    let aggregate = store.load_aggregate().await?;
    let bytes = serde_json::to_vec_pretty(&aggregate)?;
    {
        let _lock = blobs.lock(AGGREGATE_KEY).await?;
        blobs.put(AGGREGATE_KEY, &bytes).await?;
    }
    println!(
        "  Aggregate: {} ({} records)",
        output_root(&config).join(AGGREGATE_KEY).display(),
        aggregate.len()
    );
    println!();

    Ok(())
}

fn print_report(report: &BatchReport) {
    let totals = &report.totals;
    println!();
    println!("  Run {} finished in {:.1}s", report.run_id, report.elapsed_ms as f64 / 1000.0);
    println!("  Records:   {}", totals.records);
    println!("  Complete:  {}", totals.complete);
    println!("  Partial:   {}", totals.partial);
    if totals.cancelled > 0 {
        println!("  Cancelled: {}", totals.cancelled);
    }
    if totals.invalid > 0 {
        println!("  Invalid:   {}", totals.invalid);
    }
    if totals.failed > 0 {
        println!("  Failed:    {}", totals.failed);
    }
    println!("  Paid calls: {}", totals.external_calls);
}

async fn cmd_aggregate(config_path: Option<&Path>, out: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let store = ResultStore::new(blob_store(&config), RunId::new());
    let aggregate = store.load_aggregate().await?;
    let json = serde_json::to_string_pretty(&aggregate)?;

    match out {
        Some(path) => {
            std::fs::write(path, json).map_err(|e| eyre!("cannot write '{}': {e}", path.display()))?;
            println!("{} records written to {}", aggregate.len(), path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn cmd_resolve(config_path: Option<&Path>, text: &str) -> Result<()> {
    let config = load(config_path)?;
    let retrier = Retrier::new(RetryPolicy::from(&config));
    let client = build_client(retrier.policy().call_timeout.unwrap_or(std::time::Duration::from_secs(20)))?;
    let resolver = build_resolver(&config, &client, &retrier).await?;

    let resolution = resolver.resolve(text).await;
    println!("  Query:   {}", resolution.query);
    println!("  Tier:    {}", resolution.tier);
    println!("  Id:      {}", resolution.id.as_deref().unwrap_or("-"));
    println!("  Full id: {}", resolution.full_id.as_deref().unwrap_or("-"));
    if resolution.is_failed() {
        println!("  Searches for this location fall back to keywords plus result filtering.");
    }
    Ok(())
}

async fn cmd_token(config_path: Option<&Path>, force: bool, reveal: bool) -> Result<()> {
    let config = load(config_path)?;
    let retrier = Retrier::new(RetryPolicy::from(&config));
    let client = build_client(retrier.policy().call_timeout.unwrap_or(std::time::Duration::from_secs(20)))?;
    let broker = build_broker(&config, None, &client, &retrier);

    let token = broker.get_token(force).await?;
    if let Some(state) = broker.snapshot().await {
        println!("  Tier:    {}", state.tier.as_str());
        match state.expires_at {
            Some(at) => println!("  Expires: {}", at.to_rfc3339()),
            None => println!("  Expires: -"),
        }
    }
    if reveal {
        println!("{token}");
    } else {
        let prefix: String = token.chars().take(8).collect();
        println!("  Token:   {prefix}… ({} chars)", token.chars().count());
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_is_expanded() {
        let expanded = expand_home("~/leadenrich-runs");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("leadenrich-runs"));
        }
        assert_eq!(expand_home("/tmp/runs"), PathBuf::from("/tmp/runs"));
    }

    #[test]
    fn enrich_flags_parse() {
        let cli = Cli::try_parse_from([
            "leadenrich",
            "enrich",
            "--input",
            "leads.jsonl",
            "--required",
            "phone,zip",
            "--workers",
            "8",
        ])
        .unwrap();
        match cli.command {
            Command::Enrich {
                input,
                required,
                workers,
                ..
            } => {
                assert_eq!(input, PathBuf::from("leads.jsonl"));
                assert_eq!(required.as_deref(), Some("phone,zip"));
                assert_eq!(workers, Some(8));
            }
            _ => panic!("expected enrich"),
        }
    }
}
