//! Metrics and observability infrastructure for drift.
//!
//! `events` holds the internal event types and the `InternalEvent` trait;
//! events are recorded through the exporter-agnostic `metrics` facade, so
//! the host application chooses the recorder.

pub mod events;

/// Emit an internal event as a metric.
///
/// # Example
///
/// ```ignore
/// emit!(EntriesSubmitted { count: 100 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
