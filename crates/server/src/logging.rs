//! Structured file logging.
//!
//! JSON lines by default; `SLIPWAY_LOG_FORMAT=pretty` switches to
//! human-readable output for local development. The filter comes from
//! `SLIPWAY_LOG_FILTER`, then `RUST_LOG`, then a quiet default.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "server.log";

pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

pub fn init_logging(data_dir: &Path) -> anyhow::Result<LoggingHandle> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, LOG_FILE));

    let pretty = std::env::var("SLIPWAY_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("pretty"))
        .unwrap_or(false);

    // One shared base; only the output format diverges.
    let format_layer = {
        let base = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        if pretty {
            base.with_ansi(false).pretty().boxed()
        } else {
            base.json()
                .flatten_event(true)
                .with_current_span(true)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(resolve_filter())
        .with(format_layer)
        .init();

    let run_id = resolve_run_id();
    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_dir.join(LOG_FILE).display(),
        pretty = pretty,
        run_id = %run_id,
    );

    Ok(LoggingHandle { run_id, guard })
}

/// First parseable spec wins; an invalid override falls through rather
/// than silencing logs entirely.
fn resolve_filter() -> EnvFilter {
    for source in ["SLIPWAY_LOG_FILTER", "RUST_LOG"] {
        if let Ok(spec) = std::env::var(source) {
            if let Ok(filter) = EnvFilter::try_new(&spec) {
                return filter;
            }
        }
    }
    EnvFilter::new(DEFAULT_FILTER)
}

/// Stable id for correlating one server run across log lines. Callers
/// may pin it via `SLIPWAY_RUN_ID`; otherwise pid + start time.
fn resolve_run_id() -> String {
    if let Ok(id) = std::env::var("SLIPWAY_RUN_ID") {
        if !id.trim().is_empty() {
            return id;
        }
    }
    let started_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{}-{}", std::process::id(), started_ms)
}
