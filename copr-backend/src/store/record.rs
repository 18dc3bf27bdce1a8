//! Typed view of a worker record.

use super::Record;
use crate::clock::Timestamp;

/// Field names of a worker record.
pub mod fields {
    /// Set by the manager when the worker is spawned.
    pub const ALLOCATED: &str = "allocated";
    /// Set by the worker once it identified itself.
    pub const STARTED: &str = "started";
    /// Time of the last liveness probe.
    pub const CHECKED: &str = "checked";
    /// The manager gave up on the worker; reaped on the next sweep.
    pub const DELETE: &str = "delete";
    /// Terminal status written by the worker.
    pub const STATUS: &str = "status";
    /// PID of the worker process.
    pub const PID: &str = "PID";
    /// Cooperative cancellation request.
    pub const CANCEL_REQUEST: &str = "cancel_request";
    /// Sandbox label of the task the worker processes.
    pub const SANDBOX: &str = "sandbox";
}

/// Render a timestamp the way it is stored in records.
pub fn format_timestamp(ts: Timestamp) -> String {
    ts.to_string()
}

/// One worker record as read from the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerRecord {
    pub fields: Record,
}

impl WorkerRecord {
    pub fn new(fields: Record) -> Self {
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    fn timestamp(&self, field: &str) -> Option<Timestamp> {
        self.get(field).and_then(|v| v.trim().parse::<f64>().ok())
    }

    /// Allocation time; `None` for orphans (missing or unparseable).
    pub fn allocated(&self) -> Option<Timestamp> {
        self.timestamp(fields::ALLOCATED)
    }

    pub fn checked(&self) -> Option<Timestamp> {
        self.timestamp(fields::CHECKED)
    }

    pub fn is_started(&self) -> bool {
        self.fields.contains_key(fields::STARTED)
    }

    pub fn is_marked_deleted(&self) -> bool {
        self.get(fields::DELETE).is_some_and(|v| !v.is_empty())
    }

    pub fn cancel_requested(&self) -> bool {
        self.get(fields::CANCEL_REQUEST).is_some_and(|v| !v.is_empty())
    }

    pub fn status(&self) -> Option<&str> {
        self.get(fields::STATUS)
    }

    pub fn pid(&self) -> Option<u32> {
        self.get(fields::PID).and_then(|v| v.trim().parse().ok())
    }
}

impl From<Record> for WorkerRecord {
    fn from(fields: Record) -> Self {
        Self::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> WorkerRecord {
        WorkerRecord::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_parse_fields() {
        let rec = record(&[
            ("allocated", "1700000000.5"),
            ("started", "1"),
            ("PID", "4242"),
            ("status", "1"),
        ]);
        assert_eq!(rec.allocated(), Some(1_700_000_000.5));
        assert!(rec.is_started());
        assert_eq!(rec.pid(), Some(4242));
        assert_eq!(rec.status(), Some("1"));
        assert!(!rec.is_marked_deleted());
        assert_eq!(rec.checked(), None);
    }

    #[test]
    fn test_unparseable_allocation_is_orphan() {
        let rec = record(&[("allocated", "yesterday")]);
        assert_eq!(rec.allocated(), None);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = 1_700_000_123.25;
        let rec = record(&[("checked", &format_timestamp(ts))]);
        assert_eq!(rec.checked(), Some(ts));
    }
}
