//! Metrics and structured-log sink capability.
//!
//! The Hub and client core report through this surface; operators install a
//! real sink at construction. The default is a no-op.

use std::time::Duration;

/// Tag pairs attached to a metric sample.
pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// Capability surface the core calls into for observability.
pub trait MetricsSink: Send + Sync {
    fn counter_inc(&self, name: &str, tags: Tags<'_>);

    fn gauge_set(&self, name: &str, value: f64, tags: Tags<'_>);

    fn timing_observe(&self, name: &str, duration: Duration, tags: Tags<'_>);

    /// Structured event log; `fields` are flat key/value pairs.
    fn log(&self, level: log::Level, event: &str, fields: Tags<'_>);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn counter_inc(&self, _name: &str, _tags: Tags<'_>) {}

    fn gauge_set(&self, _name: &str, _value: f64, _tags: Tags<'_>) {}

    fn timing_observe(&self, _name: &str, _duration: Duration, _tags: Tags<'_>) {}

    fn log(&self, _level: log::Level, _event: &str, _fields: Tags<'_>) {}
}

/// Forwards structured events to the `log` crate and counts nothing.
///
/// Useful as a development default for the `star-hub` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn counter_inc(&self, name: &str, tags: Tags<'_>) {
        log::trace!("counter {name} +1 {tags:?}");
    }

    fn gauge_set(&self, name: &str, value: f64, tags: Tags<'_>) {
        log::trace!("gauge {name} = {value} {tags:?}");
    }

    fn timing_observe(&self, name: &str, duration: Duration, tags: Tags<'_>) {
        log::trace!("timing {name} = {duration:?} {tags:?}");
    }

    fn log(&self, level: log::Level, event: &str, fields: Tags<'_>) {
        log::log!(level, "{event} {fields:?}");
    }
}
