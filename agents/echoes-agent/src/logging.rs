//! Logging setup
//!
//! Console output is `timestamp [MODULE] LEVEL: message fields`. The module
//! color is a pure function of the module name, so the formatter carries no
//! state between events.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cli::config::LogFormat;

const RESET: &str = "\x1b[0m";

const MODULE_COLORS: [&str; 6] = [
    "\x1b[36m", // cyan
    "\x1b[35m", // magenta
    "\x1b[34m", // blue
    "\x1b[32m", // green
    "\x1b[33m", // yellow
    "\x1b[96m", // bright cyan
];

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "\x1b[31m",
        Level::WARN => "\x1b[33m",
        Level::INFO => "\x1b[32m",
        Level::DEBUG => "\x1b[34m",
        Level::TRACE => "\x1b[90m",
    }
}

/// Last path segment of a target, upper-cased
pub fn module_name(target: &str) -> String {
    target.rsplit("::").next().unwrap_or(target).to_uppercase()
}

/// Same module, same color
pub fn module_color(module: &str) -> &'static str {
    let sum: usize = module.chars().map(|c| c as usize).sum();
    MODULE_COLORS[sum % MODULE_COLORS.len()]
}

/// Everything before the message: `timestamp [MODULE] LEVEL: `
pub fn format_prefix(timestamp: &str, target: &str, level: &Level, ansi: bool) -> String {
    let module = module_name(target);
    if ansi {
        format!(
            "{timestamp} {}[{module}]{RESET} {}{level}{RESET}: ",
            module_color(&module),
            level_color(level)
        )
    } else {
        format!("{timestamp} [{module}] {level}: ")
    }
}

/// Console event formatter
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleFormat;

impl<S, N> FormatEvent<S, N> for ConsoleFormat
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
        let meta = event.metadata();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let prefix = format_prefix(&timestamp, meta.target(), meta.level(), writer.has_ansi_escapes());

        write!(writer, "{prefix}")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init(level: &str, format: LogFormat) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {level}"))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Console => registry
            .with(tracing_subscriber::fmt::layer().event_format(ConsoleFormat))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    }
    .context("Failed to install tracing subscriber")?;

    Ok(())
}
