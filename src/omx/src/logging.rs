use std::fmt;

use ansi_term::Colour;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::Config;

const LOG_ENV: &str = "OMX_LOG";
const SPAN_FILTER_ENV: &str = "OMX_TRACING_SPAN";

struct FmtLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

impl<'a> fmt::Display for FmtLevel<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (colour, name) = match *self.level {
            Level::TRACE => (Colour::Purple, "TRACE"),
            Level::DEBUG => (Colour::Blue, "DEBUG"),
            Level::INFO => (Colour::Green, " INFO"),
            Level::WARN => (Colour::Yellow, " WARN"),
            Level::ERROR => (Colour::Red, "ERROR"),
        };
        if self.ansi {
            write!(f, "{}", colour.paint(name))
        } else {
            f.pad(name)
        }
    }
}

/// `[timestamp LEVEL file:line thread] message`
struct OmxFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for OmxFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        use chrono::Utc;
        let metadata = event.metadata();
        let level = FmtLevel {
            level: metadata.level(),
            ansi: self.ansi && writer.has_ansi_escapes(),
        };
        let thread = std::thread::current();

        write!(
            writer,
            "[{} {} {}:{} {}] ",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            level,
            metadata.file().unwrap_or("<unnamed>"),
            metadata.line().unwrap_or(0),
            thread.name().unwrap_or("<unnamed>"),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber. With tracing enabled in `config`, spans are
/// also written as a chrome trace under the output directory; keep the returned
/// guard alive until exit so it gets flushed.
pub fn init_log(
    config: &Config,
    ansi: bool,
) -> anyhow::Result<Option<tracing_chrome::FlushGuard>> {
    use tracing_subscriber::prelude::*;

    let log_env_filter = EnvFilter::builder()
        .with_default_directive(config.log_level.parse()?)
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let log_fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(OmxFormatter { ansi })
        .with_filter(log_env_filter);

    let registry = tracing_subscriber::registry().with(log_fmt_layer);

    if config.tracing.enable {
        let tcfg = &config.tracing;
        std::fs::create_dir_all(&tcfg.output_dir)?;

        let span_env_filter = EnvFilter::builder()
            .with_default_directive(tcfg.span_level.parse()?)
            .with_env_var(SPAN_FILTER_ENV)
            .from_env_lossy();

        // save spans to tracing.json in output_dir
        let (chrome_layer, flush_guard) = tracing_chrome::ChromeLayerBuilder::new()
            .file(std::path::Path::new(&tcfg.output_dir).join("tracing.json"))
            .trace_style(tracing_chrome::TraceStyle::Threaded)
            .build();

        registry
            .with(chrome_layer.with_filter(span_env_filter))
            .try_init()?;
        tracing::info!("span tracing to {}", tcfg.output_dir);
        Ok(Some(flush_guard))
    } else {
        registry.try_init()?;
        tracing::debug!("logging initialized");
        Ok(None)
    }
}
