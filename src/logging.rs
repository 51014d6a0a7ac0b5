use anyhow::{Context, Result};
use colored::*;
use std::fmt;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// A tracing event formatter that colors each log line by level.
///
/// Console output shares the terminal with the report lines, so only the
/// message itself is printed: no timestamp, target or level column. Warnings
/// and errors get a short prefix so they still stand out without color.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
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
        // Buffer the fields so that the whole line can be colored at once.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => format!("WARNING: {}", buffer).yellow(),
            Level::ERROR => format!("ERROR: {}", buffer).red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Filter used when `RUST_LOG` is not set.
fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "netmeter=debug"
    } else {
        "netmeter=warn"
    }
}

/// Install the global subscriber.
///
/// Console logs go to stderr through [`ColorizedFormatter`]. With `log_file`
/// set, a second plain-text layer with timestamps and targets appends to that
/// file through a non-blocking writer.
///
/// ## Returns
/// The file writer's guard. Keep it alive until exit; dropping it flushes
/// buffered log lines.
///
/// ## Errors
/// Fails if the log file's directory does not exist or a global subscriber
/// is already installed.
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let console = tracing_subscriber::fmt::layer()
        .event_format(ColorizedFormatter)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Log file path has no file name: {:?}", path))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to install the log subscriber")?;

    Ok(guard)
}
