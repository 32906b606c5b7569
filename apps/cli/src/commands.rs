//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use recapsync_core::{
    ConfiguredGeocoder, IngestSummary, ProgressReporter, UpsertEngine, UpsertReport, add_alias,
    run_source,
};
use recapsync_pool::{HttpRecapSource, RecapPool};
use recapsync_shared::{
    AppConfig, GeocoderConfig, PoolConfig, SourceConfig, UpsertPolicy, config_file_path,
    expand_home, init_config, load_config,
};
use recapsync_sources::{Adapter, build_adapter};
use recapsync_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// recapsync: ingest competition recaps into a shared results store.
#[derive(Parser)]
#[command(
    name = "recapsync",
    version,
    about = "Scrape competition recaps and merge them into a results store.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

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
    /// Ingest configured sources into the store.
    Ingest {
        /// Source name to ingest (repeatable). Defaults to every configured source.
        #[arg(short, long = "source")]
        sources: Vec<String>,

        /// Number of parser workers.
        #[arg(long, env = "RECAPSYNC_POOL_SIZE")]
        pool_size: Option<usize>,

        /// Store database path.
        #[arg(long, env = "RECAPSYNC_DB")]
        db: Option<String>,
    },

    /// Parse a saved results page and print its recaps as JSON.
    Parse {
        /// HTML file to parse.
        file: PathBuf,
    },

    /// Record an alias for a group, merging duplicate group records.
    Alias {
        /// Canonical group name.
        group: String,

        /// Alternative name to record.
        alias: String,

        /// Store database path.
        #[arg(long, env = "RECAPSYNC_DB")]
        db: Option<String>,
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
        0 => "recapsync=info",
        1 => "recapsync=debug",
        _ => "recapsync=trace",
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
    match cli.command {
        Command::Ingest {
            sources,
            pool_size,
            db,
        } => cmd_ingest(&sources, pool_size, db.as_deref()).await,
        Command::Parse { file } => cmd_parse(&file).await,
        Command::Alias { group, alias, db } => cmd_alias(&group, &alias, db.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// ingest
// ---------------------------------------------------------------------------

async fn open_store(config: &AppConfig, db: Option<&str>) -> Result<Storage> {
    let path = expand_home(db.unwrap_or(&config.defaults.database_path))?;
    info!(path = %path.display(), "opening store");
    Ok(Storage::open(&path).await?)
}

fn select_sources<'c>(config: &'c AppConfig, names: &[String]) -> Result<Vec<&'c SourceConfig>> {
    if config.sources.is_empty() {
        return Err(eyre!(
            "no sources configured; add a [[sources]] table to {}",
            config_file_path()?.display()
        ));
    }
    if names.is_empty() {
        return Ok(config.sources.iter().collect());
    }
    names
        .iter()
        .map(|name| {
            config
                .sources
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| eyre!("unknown source '{name}'"))
        })
        .collect()
}

async fn cmd_ingest(names: &[String], pool_size: Option<usize>, db: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let selected = select_sources(&config, names)?;

    let mut pool_config = PoolConfig::from(&config);
    if let Some(size) = pool_size {
        pool_config.size = size.max(1);
    }

    let adapters = selected
        .iter()
        .map(|s| build_adapter(s, pool_config.fetch_timeout))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let storage = open_store(&config, db).await?;
    let geocoder = ConfiguredGeocoder::from_config(
        &GeocoderConfig::from(&config),
        &storage,
        pool_config.fetch_timeout,
    )?;
    let engine = UpsertEngine::new(&storage, &geocoder, UpsertPolicy::from(&config));

    let source = HttpRecapSource::from(&pool_config);
    let pool = RecapPool::new(source.clone(), pool_config);
    info!(workers = pool.size(), sources = adapters.len(), "starting ingestion");

    let reporter = CliProgress::new();
    let outcome = tokio::select! {
        results = ingest_all(&adapters, &pool, &source, &engine, &storage, &reporter) => Some(results),
        _ = tokio::signal::ctrl_c() => None,
    };
    reporter.spinner.finish_and_clear();
    pool.close().await;

    let Some(results) = outcome else {
        warn!("interrupted; pending jobs cancelled");
        return Err(eyre!("interrupted"));
    };

    let mut attempted = 0;
    let mut succeeded = 0;
    println!();
    for (name, result) in &results {
        match result {
            Ok(summary) => {
                attempted += summary.listed;
                succeeded += summary.upserted + summary.skipped;
                print_summary(summary);
            }
            Err(e) => {
                attempted += 1;
                println!("  {name}: listing failed: {e}");
                println!();
            }
        }
    }

    if attempted > 0 && succeeded == 0 {
        return Err(eyre!("ingestion failed: no events were ingested"));
    }
    Ok(())
}

async fn ingest_all(
    adapters: &[Adapter],
    pool: &RecapPool,
    source: &HttpRecapSource,
    engine: &UpsertEngine<'_, Storage, ConfiguredGeocoder<'_>>,
    storage: &Storage,
    reporter: &CliProgress,
) -> Vec<(String, recapsync_shared::Result<IngestSummary>)> {
    use recapsync_sources::SourceAdapter;

    let mut results = Vec::with_capacity(adapters.len());
    for adapter in adapters {
        let result = run_source(adapter, pool, source, engine, storage, reporter).await;
        if let Err(e) = &result {
            warn!(source = adapter.name(), error = %e, "source failed");
        }
        results.push((adapter.name().to_string(), result));
    }
    results
}

fn print_summary(summary: &IngestSummary) {
    println!("  Source:   {}", summary.source);
    println!("  Listed:   {}", summary.listed);
    println!("  Parsed:   {}", summary.parsed);
    println!("  Upserted: {}", summary.upserted);
    println!("  Skipped:  {}", summary.skipped);
    println!("  Failed:   {}", summary.failed);
    for error in &summary.errors {
        println!("    - {error}");
    }
    println!(
        "  Time:     {:.1}s",
        summary.elapsed_ms as f64 / 1000.0
    );
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn event_parsed(&self, name: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Parsed [{current}/{total}] {name}"));
    }

    fn event_upserted(&self, name: &str, report: &UpsertReport) {
        if report.failures > 0 {
            self.spinner.println(format!(
                "  ! {name}: {} write(s) failed",
                report.failures
            ));
        }
    }

    fn done(&self, summary: &IngestSummary) {
        self.spinner
            .set_message(format!("{} done", summary.source));
    }
}

// ---------------------------------------------------------------------------
// parse / alias / config
// ---------------------------------------------------------------------------

async fn cmd_parse(file: &Path) -> Result<()> {
    let page = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| eyre!("cannot read '{}': {e}", file.display()))?;
    let recaps = recapsync_recap::parse_page(&page)?;
    info!(file = %file.display(), recaps = recaps.len(), "page parsed");
    println!("{}", serde_json::to_string_pretty(&recaps)?);
    Ok(())
}

async fn cmd_alias(group: &str, alias: &str, db: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let storage = open_store(&config, db).await?;
    let merge = add_alias(&storage, group, alias).await?;

    println!();
    println!("  Alias recorded.");
    println!("  Group:    {group} ({})", merge.group_id);
    println!("  Aliases:  {}", merge.aliases.join(", "));
    println!("  Merged:   {} duplicate(s)", merge.merged);
    println!("  Relinked: {} event(s)", merge.relinked_events);
    println!();
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use recapsync_shared::SourceKind;

    fn config_with(names: &[&str]) -> AppConfig {
        AppConfig {
            sources: names
                .iter()
                .map(|name| SourceConfig {
                    name: name.to_string(),
                    kind: SourceKind::CompetitionSuite,
                    season: Some("2025".into()),
                    bridge_url: None,
                    recap_base_url: None,
                    path: None,
                })
                .collect(),
            ..AppConfig::default()
        }
    }

    #[test]
    fn parses_ingest_flags() {
        let cli = Cli::parse_from([
            "recapsync", "-vv", "ingest", "--source", "WGI", "-s", "SCPA", "--pool-size", "5",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Ingest {
                sources, pool_size, ..
            } => {
                assert_eq!(sources, ["WGI", "SCPA"]);
                assert_eq!(pool_size, Some(5));
            }
            _ => panic!("expected ingest"),
        }
    }

    #[test]
    fn selects_named_sources_in_order() {
        let config = config_with(&["WGI", "SCPA", "NCPA"]);
        let all = select_sources(&config, &[]).unwrap();
        assert_eq!(all.len(), 3);

        let picked = select_sources(&config, &["ncpa".into(), "WGI".into()]).unwrap();
        let names: Vec<_> = picked.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["NCPA", "WGI"]);

        assert!(select_sources(&config, &["FFCC".into()]).is_err());
        assert!(select_sources(&AppConfig::default(), &[]).is_err());
    }
}
