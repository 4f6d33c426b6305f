//! Diagnostics: the log line format and per-component reporting thresholds.
//!
//! Lines are `[HH:MM:SS.uuuuuu (level)] [prefix]message` with a
//! `--- [YYYY-MM-DD] ---` marker whenever the UTC day changes. Levels are
//! rendered on the numeric severity scale the store file's
//! `DiagnosticReportingThresholds` uses (error 10, warning 5, info 3,
//! debug 1, trace 0); those thresholds become per-target filters.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex as WriterMutex;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    Layer,
    filter::{LevelFilter, Targets},
    fmt::{
        FmtContext, FormatEvent, FormatFields,
        format::Writer,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use alfred_core::Configuration;

/// Event formatter producing the service's line format.
#[derive(Default)]
pub struct LineFormat {
    last_day: Mutex<i32>,
}

impl LineFormat {
    /// Creates a formatter; the first line it writes is preceded by a day
    /// marker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = Utc::now();
        {
            let mut last_day = self.last_day.lock();
            let today = now.num_days_from_ce();
            if *last_day != today {
                *last_day = today;
                writeln!(writer, "--- [{}] ---", now.format("%Y-%m-%d"))?;
            }
        }
        write!(
            writer,
            "[{} ({})] [{}]",
            now.format("%H:%M:%S%.6f"),
            severity(event.metadata().level()),
            event.metadata().target()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Renders a tracing level on the numeric severity scale.
fn severity(level: &Level) -> usize {
    if *level == Level::ERROR {
        10
    } else if *level == Level::WARN {
        5
    } else if *level == Level::INFO {
        3
    } else if *level == Level::DEBUG {
        1
    } else {
        0
    }
}

/// Maps a `DiagnosticReportingThresholds` component name onto the tracing
/// target it governs. Unknown names are tolerated so store files can carry
/// thresholds for other revisions.
fn component_target(component: &str) -> Option<&'static str> {
    match component {
        "Alfred" => Some("alfred_cli"),
        "Store" => Some("alfred_core::store"),
        "ApiHttp" => Some("alfred_cli::api"),
        "ApiWs" | "WebSocket" => Some("alfred_cli::handlers::ws"),
        "HttpClientTransactions" => Some("alfred_cli::transactions"),
        _ => None,
    }
}

/// Translates a severity floor into the loosest tracing level at or above
/// it.
fn threshold_level(floor: i64) -> LevelFilter {
    if floor >= 10 {
        LevelFilter::ERROR
    } else if floor >= 5 {
        LevelFilter::WARN
    } else if floor >= 2 {
        LevelFilter::INFO
    } else if floor >= 1 {
        LevelFilter::DEBUG
    } else {
        LevelFilter::TRACE
    }
}

/// Builds the target filter from the configured thresholds, over an `info`
/// default.
#[must_use]
pub fn reporting_filter(configuration: &Configuration) -> Targets {
    let mut targets = Targets::new().with_default(LevelFilter::INFO);
    for (component, floor) in &configuration.diagnostic_reporting_thresholds {
        if let Some(target) = component_target(component) {
            targets = targets.with_target(target, threshold_level(*floor));
        }
    }
    targets
}

/// Default log file path: `log.txt` next to the executable.
fn default_log_file() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("log.txt")))
        .unwrap_or_else(|| PathBuf::from("log.txt"))
}

/// Installs the global diagnostics subscriber. Daemon mode appends to the
/// configured log file; otherwise lines go to stdout.
pub fn init(configuration: &Configuration, daemon: bool) -> Result<()> {
    let filter = reporting_filter(configuration);
    let layer = if daemon {
        let path = configuration
            .log_file
            .as_ref()
            .map_or_else(default_log_file, PathBuf::from);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("unable to open log file {}", path.display()))?;
        tracing_subscriber::fmt::layer()
            .event_format(LineFormat::new())
            .with_writer(WriterMutex::new(file))
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .event_format(LineFormat::new())
            .with_writer(io::stdout)
            .boxed()
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("unable to install the diagnostics subscriber")?;
    Ok(())
}
