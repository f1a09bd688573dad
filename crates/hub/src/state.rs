use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;
use time::OffsetDateTime;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Recent engine activity for the status endpoint.
pub struct EventLog {
    started_at: Instant,
    events: VecDeque<EngineEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub sensor_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Connection,
    Alert,
    Calibration,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn record(&mut self, kind: EventKind, sensor_id: Option<&str>, detail: impl Into<String>) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(EngineEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            sensor_id: sensor_id.map(str::to_string),
            detail: detail.into(),
        });
    }

    pub fn system(&mut self, detail: impl Into<String>) {
        self.record(EventKind::System, None, detail);
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<EngineEvent> {
        self.events.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_log_is_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert!(log.recent().is_empty());
    }

    #[test]
    fn recent_is_newest_first() {
        let mut log = EventLog::new();
        log.system("hub started");
        log.record(EventKind::Connection, Some("ec-1"), "connected");
        let events = log.recent();
        assert_eq!(events[0].kind, EventKind::Connection);
        assert_eq!(events[0].sensor_id.as_deref(), Some("ec-1"));
        assert_eq!(events[1].detail, "hub started");
    }

    #[test]
    fn ring_buffer_caps_at_max_events() {
        let mut log = EventLog::new();
        for i in 0..(MAX_EVENTS + 25) {
            log.record(EventKind::Reading, Some("t-1"), format!("event {i}"));
        }
        assert_eq!(log.len(), MAX_EVENTS);
        // Oldest 25 were evicted.
        assert_eq!(log.recent().last().unwrap().detail, "event 25");
    }

    #[test]
    fn event_kind_serializes_lowercase() {
        let mut log = EventLog::new();
        log.record(EventKind::Calibration, Some("ph-1"), "passed");
        let json = serde_json::to_value(&log.recent()[0]).unwrap();
        assert_eq!(json["kind"], "calibration");
        assert!(json["ts"].is_string());
    }
}
