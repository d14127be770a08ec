use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::field::VisitOutput;
use tracing_subscriber::fmt::format::{DefaultVisitor, Writer};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Prefixes every event with the process ID and level.
///
/// e.g.: "[4711] INFO: server is running at pid 4711"
///
/// While a reload is in progress both the old and the new instance write to the same stderr,
/// the prefix tells them apart.
pub struct PidFormatter {
    pid: u32,
}

impl PidFormatter {
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
        }
    }
}

impl Default for PidFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, N> FormatEvent<C, N> for PidFormatter
where
    C: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, C, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "[{}] {}: ",
            self.pid,
            event.metadata().level().as_str()
        )?;

        let mut v = DefaultVisitor::new(writer.by_ref(), true);
        event.record(&mut v);
        v.finish()?;
        writer.write_char('\n')
    }
}
