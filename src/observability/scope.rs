//! Begin/complete logging around a unit of work

use std::cell::Cell;
use std::time::Instant;

use super::logger::Logger;

/// Logs `{name}_BEGIN` on creation and exactly one of `{name}_COMPLETE`,
/// `{name}_FAILED` or `{name}_INCOMPLETE` (on drop) afterwards.
///
/// Fields given at creation are repeated on the closing line together
/// with `elapsed_ms`.
pub struct ObservationScope {
    name: &'static str,
    fields: Vec<(&'static str, String)>,
    timer: Timer,
    closed: Cell<bool>,
}

impl ObservationScope {
    pub fn new(name: &'static str) -> Self {
        Self::with_fields(name, &[])
    }

    pub fn with_fields(name: &'static str, fields: &[(&'static str, &str)]) -> Self {
        let fields: Vec<(&'static str, String)> =
            fields.iter().map(|(k, v)| (*k, v.to_string())).collect();
        let scope = Self {
            name,
            fields,
            timer: Timer::new(),
            closed: Cell::new(false),
        };
        Logger::info(&format!("{}_BEGIN", name), &scope.field_refs());
        scope
    }

    fn field_refs(&self) -> Vec<(&str, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect()
    }

    pub fn complete(self) {
        self.complete_with_fields(&[]);
    }

    pub fn complete_with_fields(self, extra: &[(&str, &str)]) {
        self.closed.set(true);
        let elapsed = self.timer.elapsed_ms();
        let mut fields = self.field_refs();
        fields.extend(extra.iter().copied());
        fields.push(("elapsed_ms", &elapsed));
        Logger::info(&format!("{}_COMPLETE", self.name), &fields);
    }

    pub fn fail(self, reason: &str) {
        self.closed.set(true);
        let mut fields = self.field_refs();
        fields.push(("reason", reason));
        Logger::error(&format!("{}_FAILED", self.name), &fields);
    }

    pub fn fail_fatal(self, reason: &str) {
        self.closed.set(true);
        let mut fields = self.field_refs();
        fields.push(("reason", reason));
        Logger::fatal(&format!("{}_FAILED", self.name), &fields);
    }

    pub fn is_completed(&self) -> bool {
        self.closed.get()
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.closed.get() {
            let mut fields = self.field_refs();
            fields.push(("reason", "scope dropped without completion"));
            Logger::warn(&format!("{}_INCOMPLETE", self.name), &fields);
        }
    }
}

/// Wall-clock timer used for `elapsed_ms` fields
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> String {
        self.start.elapsed().as_millis().to_string()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_closes_once() {
        let scope = ObservationScope::with_fields("TEST_SCOPE", &[("backup_id", "7")]);
        assert!(!scope.is_completed());
        scope.complete_with_fields(&[("partitions", "3")]);
    }

    #[test]
    fn test_scope_fail_and_drop_do_not_panic() {
        ObservationScope::new("TEST_SCOPE").fail("disk full");
        let scope = ObservationScope::new("TEST_SCOPE");
        drop(scope);
    }

    #[test]
    fn test_timer_reports_number() {
        let timer = Timer::new();
        assert!(timer.elapsed_ms().parse::<u128>().is_ok());
    }
}
