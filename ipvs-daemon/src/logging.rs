//! Logging initialization for ipvs-daemon.
//!
//! `general.log_level` applies to the ipvs crates only. Dependencies such as
//! the tokio runtime and the Prometheus exporter stay at `warn`.
//! `RUST_LOG`, when set, replaces the whole filter.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ipvs_core::config::GeneralConfig;

/// Crates whose events follow `general.log_level`.
const IPVS_TARGETS: &[&str] = &["ipvs_core", "ipvs_engine", "ipvs_daemon"];

/// Level for every other target.
const DEPENDENCY_LEVEL: &str = "warn";

/// Filter directives derived from `general.log_level`.
pub fn filter_directives(log_level: &str) -> String {
    let mut directives = vec![DEPENDENCY_LEVEL.to_owned()];
    directives.extend(IPVS_TARGETS.iter().map(|target| format!("{target}={log_level}")));
    directives.join(",")
}

fn build_filter(config: &GeneralConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(filter_directives(&config.log_level))
        .with_context(|| format!("invalid log level '{}'", config.log_level))
}

/// Initialize the global tracing subscriber.
///
/// Must be called exactly once, before the engine is built.
///
/// # Formats
///
/// * `"json"` - one JSON object per line with event fields flattened to the
///   top level, so `service`, `dest` and `client` are directly queryable
/// * `"pretty"` - multi-line output with thread ids (sweep and rate tasks
///   run on runtime workers)
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    let filter = build_filter(config)?;

    match config.log_format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false),
            )
            .try_init()
            .context("failed to initialize JSON tracing subscriber")?,
        "pretty" => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty().with_thread_ids(true))
            .try_init()
            .context("failed to initialize pretty tracing subscriber")?,
        other => anyhow::bail!("unknown log format '{other}', expected 'json' or 'pretty'"),
    }

    Ok(())
}
