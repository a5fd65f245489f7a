//! Log output in the gout line format.
//!
//! Every event is rendered to stdout as `[<tag> <ts>] message fields`,
//! where `<ts>` is `YYYY_MM_DD-HH:MM.` followed by microseconds at 10 µs
//! resolution, zero-padded to four digits. No rotation, no level prefix.

use std::fmt;

use chrono::{Local, Timelike};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

struct LineFormat {
    tag: &'static str,
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
        let now = Local::now();
        write!(
            writer,
            "[{} {}{:04}] ",
            self.tag,
            now.format("%Y_%m_%d-%H:%M."),
            now.nanosecond() / 100_000
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the process-wide subscriber; `tag` is `gout` or `gout_server`.
///
/// Verbosity follows `RUST_LOG` when set, `info` otherwise.
pub fn init(tag: &'static str) {
    tracing_subscriber::fmt()
        .event_format(LineFormat { tag })
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
