//! provides logging helpers

use std::fmt;
use std::path::Path;

use anyhow::Context;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Events logged with a target containing this go to the stats file only.
pub const STATS_TARGET: &str = "stats";

/// Writes only the `message` field of an event, one line per event.
struct MessageOnly;

struct MessageVisitor {
    msg: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.msg.push_str(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.msg.push_str(&format!("{value:?}"));
        }
    }
}

impl<S, N> FormatEvent<S, N> for MessageOnly
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MessageVisitor { msg: String::new() };
        event.record(&mut visitor);
        writeln!(writer, "{}", visitor.msg)
    }
}

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
pub fn init() {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).init();
}

/// Like [`init`], but also routes stats events into a daily rolling file.
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// as long as the program logs.
pub fn init_with_stats_file<P: AsRef<Path>>(stats_file: P) -> anyhow::Result<WorkerGuard> {
    let stats_file = stats_file.as_ref();
    let dir = stats_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = stats_file
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid stats file path {}", stats_file.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
        .with_context(|| format!("failed to create rolling file appender in {}", dir.display()))?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter().and(filter::filter_fn(|metadata| {
            !metadata.target().contains(STATS_TARGET)
        })));

    let stats_layer = layer()
        .event_format(MessageOnly)
        .fmt_fields(format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target().contains(STATS_TARGET)
        }));

    registry()
        .with(fmt_layer)
        .with(stats_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;
    Ok(file_guard)
}
