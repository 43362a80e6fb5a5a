//! Bounded in-memory event log backing the plain-text dump.
//!
//! The state machine and each client keep one of these; records are plain
//! strings with a wall-clock timestamp, dumped reverse-chronologically.

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt::Write;

/// Default number of records kept per log.
const DEFAULT_CAPACITY: usize = 128;

/// A bounded ring of timestamped records.
#[derive(Debug)]
pub struct EventLog {
    name: String,
    records: VecDeque<(DateTime<Local>, String)>,
    capacity: usize,
}

impl EventLog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: VecDeque::with_capacity(DEFAULT_CAPACITY),
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Appends a record, evicting the oldest when full.
    pub fn record(&mut self, message: impl Into<String>) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back((Local::now(), message.into()));
    }

    /// Writes this log into `out`, newest record first.
    pub fn dump_into(&self, out: &mut String) {
        let _ = writeln!(out, "--- {} ---", self.name);
        for (at, message) in self.records.iter().rev() {
            let _ = writeln!(out, "{} {}", at.format("%Y-%m-%d %H:%M:%S%.3f"), message);
        }
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_dumped_newest_first() {
        let mut log = EventLog::new("test");
        log.record("first");
        log.record("second");

        let mut out = String::new();
        log.dump_into(&mut out);

        let first_pos = out.find("first").unwrap();
        let second_pos = out.find("second").unwrap();
        assert!(second_pos < first_pos, "dump was:\n{out}");
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut log = EventLog::new("test");
        for i in 0..200 {
            log.record(format!("record {i}"));
        }
        assert_eq!(log.len(), DEFAULT_CAPACITY);

        let mut out = String::new();
        log.dump_into(&mut out);
        assert!(!out.contains("record 0\n"));
        assert!(out.contains("record 199"));
    }
}
