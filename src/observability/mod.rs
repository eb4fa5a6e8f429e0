//! Observability
//!
//! - Structured logging (JSON lines)
//! - Typed lifecycle events
//! - Counter metrics
//!
//! Observability is read-only: nothing here changes control-plane state,
//! and a failed log write is ignored.
//!
//! ```ignore
//! use topoplane::observability::{log_event_with_fields, Event};
//!
//! log_event_with_fields(Event::ClusterCreated, &[("domain", "cache.db")]);
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};

/// Log a lifecycle event
pub fn log_event(event: Event) {
    log_event_with_fields(event, &[]);
}

/// Log a lifecycle event with fields
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    let severity = if event.is_fatal() {
        Severity::Fatal
    } else {
        Severity::Info
    };
    Logger::log(severity, event.as_str(), fields);
}

/// Log a lifecycle event at an explicit severity
pub fn log_event_at(severity: Severity, event: Event, fields: &[(&str, &str)]) {
    Logger::log(severity, event.as_str(), fields);
}
