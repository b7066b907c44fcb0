//! Session lifecycle tracking.
//!
//! Devices do not announce logins; a session starts when signals arrive
//! after a silence and ends when the heartbeat window lapses or the
//! agent reports an explicit logout. Timeouts are detected lazily, on
//! the next heartbeat or report for the device or during a retention
//! sweep, so the engine needs no background timer of its own. Ordinary
//! detection signals refresh liveness without evaluating transitions.

use tracing::debug;

use crate::model::{DeviceState, SessionEventType, SessionRecord, Signal};

/// Signal names treated as an explicit logout report.
const LOGOUT_NAMES: &[&str] = &["logout", "session end", "user logoff", "shutdown"];

/// Signal names that force a session-state check on arrival. Ordinary
/// detection signals only refresh liveness.
const TRIGGER_NAMES: &[&str] = &[
    "heartbeat",
    "periodic summary",
    "batch report",
    "device identity",
    "session start",
    "login",
];

#[derive(Debug, Clone)]
pub struct SessionTracker {
    heartbeat_timeout_secs: i64,
}

impl SessionTracker {
    pub fn new(heartbeat_timeout_secs: u64) -> Self {
        Self {
            heartbeat_timeout_secs: heartbeat_timeout_secs as i64,
        }
    }

    fn is_logout(signal: &Signal) -> bool {
        let name = signal.name.to_ascii_lowercase();
        LOGOUT_NAMES.iter().any(|n| name.contains(n))
    }

    /// Whether a signal forces a state check. Heartbeats, summary and
    /// batch reports, and explicit start/stop events do.
    fn forces_state_check(signal: &Signal) -> bool {
        let name = signal.name.to_ascii_lowercase();
        TRIGGER_NAMES.iter().any(|n| name.contains(n)) || Self::is_logout(signal)
    }

    /// Whether the device's session has silently expired as of this
    /// signal's timestamp.
    pub fn is_stale(&self, dev: &DeviceState, signal: &Signal) -> bool {
        !dev.logged_out && signal.timestamp - dev.last_seen > self.heartbeat_timeout_secs
    }

    fn close_timed_out(&self, dev: &mut DeviceState) -> SessionRecord {
        // The session ended one heartbeat window after the last signal,
        // not at the moment the timeout was noticed.
        let session_end = dev.last_seen + self.heartbeat_timeout_secs;
        dev.session_end = session_end;
        dev.logged_out = true;
        SessionRecord {
            device_id: dev.device_id.clone(),
            event_type: SessionEventType::Logout,
            timestamp: session_end,
            session_start: dev.session_start,
            session_end,
            duration_seconds: (session_end - dev.session_start).max(0),
            final_threat_score: dev.threat_score,
        }
    }

    fn open_session(&self, dev: &mut DeviceState, at: i64) -> SessionRecord {
        dev.session_start = at;
        dev.session_end = 0;
        dev.logged_out = false;
        dev.threat_score = 0.0;
        SessionRecord {
            device_id: dev.device_id.clone(),
            event_type: SessionEventType::Login,
            timestamp: at,
            session_start: at,
            session_end: 0,
            duration_seconds: 0,
            final_threat_score: 0.0,
        }
    }

    /// Applies a signal to the device's session state, returning session
    /// log entries in the order they occurred.
    ///
    /// Only state-check triggers evaluate transitions: a trigger arriving
    /// after a lapsed heartbeat window first closes the old session, then
    /// opens a new one at the signal's timestamp, and an explicit logout
    /// closes the session at the signal's timestamp. Ordinary detection
    /// signals refresh `last_seen` only; [`SessionTracker::sweep`] still
    /// closes sessions that went silent.
    pub fn observe(&self, dev: &mut DeviceState, signal: &Signal) -> Vec<SessionRecord> {
        let mut records = Vec::new();

        if Self::forces_state_check(signal) {
            if self.is_stale(dev, signal) {
                debug!(device_id = %dev.device_id, "session timed out, reopening");
                records.push(self.close_timed_out(dev));
                records.push(self.open_session(dev, signal.timestamp));
            } else if dev.logged_out {
                debug!(device_id = %dev.device_id, "device reactivated after logout");
                records.push(self.open_session(dev, signal.timestamp));
            }

            if Self::is_logout(signal) {
                dev.session_end = signal.timestamp;
                dev.logged_out = true;
                records.push(SessionRecord {
                    device_id: dev.device_id.clone(),
                    event_type: SessionEventType::Logout,
                    timestamp: signal.timestamp,
                    session_start: dev.session_start,
                    session_end: signal.timestamp,
                    duration_seconds: (signal.timestamp - dev.session_start).max(0),
                    final_threat_score: dev.threat_score,
                });
            }
        }

        dev.last_seen = dev.last_seen.max(signal.timestamp);
        records
    }

    /// Closes the session of a device that went silent, if its window has
    /// lapsed by `now`. Called from the retention sweep.
    pub fn sweep(&self, dev: &mut DeviceState, now: i64) -> Option<SessionRecord> {
        if !dev.logged_out && now - dev.last_seen > self.heartbeat_timeout_secs {
            Some(self.close_timed_out(dev))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SignalStatus;

    fn signal(ts: i64, name: &str) -> Signal {
        Signal::new(ts, "d1", "system", name, SignalStatus::Info, "")
    }

    fn tracker() -> SessionTracker {
        SessionTracker::new(120)
    }

    #[test]
    fn test_heartbeats_keep_session_open() {
        let t = tracker();
        let mut dev = DeviceState::from_signal(&signal(0, "heartbeat"));
        assert!(t.observe(&mut dev, &signal(60, "heartbeat")).is_empty());
        assert!(t.observe(&mut dev, &signal(119, "heartbeat")).is_empty());
        assert!(!dev.logged_out);
        assert_eq!(dev.session_start, 0);
    }

    #[test]
    fn test_timeout_closes_then_reopens() {
        let t = tracker();
        let mut dev = DeviceState::from_signal(&signal(0, "heartbeat"));
        t.observe(&mut dev, &signal(60, "heartbeat"));

        let records = t.observe(&mut dev, &signal(400, "heartbeat"));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_type, SessionEventType::Logout);
        // Session ended one window after the last signal at t=60.
        assert_eq!(records[0].session_end, 180);
        assert_eq!(records[0].duration_seconds, 180);
        assert_eq!(records[1].event_type, SessionEventType::Login);
        assert_eq!(records[1].session_start, 400);
        assert_eq!(dev.session_start, 400);
        assert!(!dev.logged_out);
    }

    #[test]
    fn test_explicit_logout() {
        let t = tracker();
        let mut dev = DeviceState::from_signal(&signal(0, "heartbeat"));
        let records = t.observe(&mut dev, &signal(90, "User Logoff"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, SessionEventType::Logout);
        assert_eq!(records[0].session_end, 90);
        assert_eq!(records[0].duration_seconds, 90);
        assert!(dev.logged_out);
    }

    #[test]
    fn test_signal_after_logout_opens_new_session() {
        let t = tracker();
        let mut dev = DeviceState::from_signal(&signal(0, "heartbeat"));
        dev.threat_score = 40.0;
        t.observe(&mut dev, &signal(90, "logout"));

        let records = t.observe(&mut dev, &signal(100, "heartbeat"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, SessionEventType::Login);
        assert_eq!(dev.session_start, 100);
        assert_eq!(dev.threat_score, 0.0);
        assert!(!dev.logged_out);
    }

    #[test]
    fn test_detection_signal_only_refreshes_liveness() {
        let t = tracker();
        let mut dev = DeviceState::from_signal(&signal(0, "heartbeat"));
        t.observe(&mut dev, &signal(60, "heartbeat"));

        // Well past the heartbeat window, but not a state-check trigger.
        let warn = Signal::new(400, "d1", "network", "Beacon", SignalStatus::Warn, "conn out");
        let records = t.observe(&mut dev, &warn);
        assert!(records.is_empty());
        assert_eq!(dev.last_seen, 400);
        assert!(!dev.logged_out);
        assert_eq!(dev.session_start, 0);
    }

    #[test]
    fn test_detection_signal_does_not_reopen_after_logout() {
        let t = tracker();
        let mut dev = DeviceState::from_signal(&signal(0, "heartbeat"));
        t.observe(&mut dev, &signal(90, "logout"));

        let warn = Signal::new(100, "d1", "network", "Beacon", SignalStatus::Warn, "conn out");
        assert!(t.observe(&mut dev, &warn).is_empty());
        assert!(dev.logged_out);

        // The next heartbeat performs the deferred check and reopens.
        let records = t.observe(&mut dev, &signal(110, "heartbeat"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, SessionEventType::Login);
        assert_eq!(dev.session_start, 110);
    }

    #[test]
    fn test_sweep_closes_silent_device() {
        let t = tracker();
        let mut dev = DeviceState::from_signal(&signal(0, "heartbeat"));
        assert!(t.sweep(&mut dev, 100).is_none());
        let record = t.sweep(&mut dev, 300).expect("session should close");
        assert_eq!(record.event_type, SessionEventType::Logout);
        assert_eq!(record.session_end, 120);
        assert!(dev.logged_out);
        // Already closed, no second record.
        assert!(t.sweep(&mut dev, 400).is_none());
    }

    #[test]
    fn test_final_score_carried_into_logout_record() {
        let t = tracker();
        let mut dev = DeviceState::from_signal(&signal(0, "heartbeat"));
        dev.threat_score = 72.5;
        let records = t.observe(&mut dev, &signal(400, "heartbeat"));
        assert_eq!(records[0].final_threat_score, 72.5);
        // New session starts clean.
        assert_eq!(dev.threat_score, 0.0);
    }
}
