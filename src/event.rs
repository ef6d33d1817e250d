//! The log event record and wall-clock formatting.

use chrono::{DateTime, Local, Utc};

use crate::level::Level;
use crate::logger::SubsystemId;

/// A single log event. Immutable once it leaves the submitting thread; the
/// delivery worker fills in [`time_string`](LogEvent::time_string) exactly
/// once before fanout so every sink renders the same timestamp.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: Level,
    pub subsystem: SubsystemId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Name of the function that submitted the event, `"/UNKNOWN/"` if the
    /// call site did not provide one.
    pub function: String,
    /// Subsystem name, resolved from the handle at submission time.
    pub subsystem_name: String,
    /// Rendered timestamp, filled in by the delivery worker.
    pub time_string: String,
}

/// Render a timestamp as `YYYY-MM-DD HH:MM:SS.mmm`.
///
/// Uses UTC with a `" GMT"` suffix when the `utc-timestamps` feature is
/// enabled, local time otherwise.
pub fn format_time(t: &DateTime<Utc>) -> String {
    format_time_in(t, cfg!(feature = "utc-timestamps"))
}

/// [`format_time`] with an explicit zone choice.
pub fn format_time_in(t: &DateTime<Utc>, utc: bool) -> String {
    let millis = t.timestamp_subsec_millis();
    if utc {
        format!("{}.{:03} GMT", t.format("%Y-%m-%d %H:%M:%S"), millis)
    } else {
        let local = t.with_timezone(&Local);
        format!("{}.{:03}", local.format("%Y-%m-%d %H:%M:%S"), millis)
    }
}

/// Render a timestamp as `<seconds-since-epoch>.<mmm>`, used to stamp
/// archived log files.
pub fn format_stamp(t: &DateTime<Utc>) -> String {
    format!("{}.{:03}", t.timestamp(), t.timestamp_subsec_millis())
}
