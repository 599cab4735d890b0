//! Observability: structured logs, typed events, counters
//!
//! ```ignore
//! use regionvault::observability::{log_event_with_fields, Event, ObservationScope};
//!
//! log_event_with_fields(Event::BlobStored, &[("hash", &hash.to_string())]);
//!
//! let scope = ObservationScope::with_fields("BACKUP", &[("comment", "nightly")]);
//! // ... work ...
//! scope.complete();
//! ```
//!
//! Logging never fails the operation being logged.

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};

/// Logs a lifecycle event at its own severity.
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_does_not_panic() {
        log_event(Event::ConfigLoaded);
        log_event_with_fields(Event::BlobStored, &[("hash", "ab12"), ("size", "4")]);
        log_event_with_fields(Event::RestoreAborted, &[("reason", "test")]);
    }
}
