//! Core data models for Fleetwatch.
//!
//! This module defines the structures that flow through the ingestion
//! engine: raw signals from device agents, the detection records derived
//! from them, per-device state, session log entries and aggregate points.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::router::SectionKey;

/// Upper bound on the historical threat-level ring kept per device.
pub const HISTORY_CAP: usize = 100;

/// Status reported with a signal, in descending severity order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignalStatus {
    #[serde(rename = "CRITICAL")]
    Critical,
    #[serde(rename = "ALERT")]
    Alert,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "OFF")]
    Off,
    #[serde(rename = "UNK")]
    Unknown,
}

impl SignalStatus {
    /// Severity rank used when picking the highest status across merged
    /// records. Critical > Alert > Warn > Info; the remaining statuses
    /// never win a merge.
    pub fn rank(&self) -> u8 {
        match self {
            SignalStatus::Critical => 4,
            SignalStatus::Alert => 3,
            SignalStatus::Warn => 2,
            SignalStatus::Info => 1,
            SignalStatus::Ok | SignalStatus::Off | SignalStatus::Unknown => 0,
        }
    }

    /// Point weight contributed to hourly aggregates.
    pub fn weight(&self) -> u32 {
        match self {
            SignalStatus::Critical => 15,
            SignalStatus::Alert => 10,
            SignalStatus::Warn => 5,
            _ => 0,
        }
    }

    /// Returns the higher-severity of two statuses.
    pub fn max(self, other: SignalStatus) -> SignalStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalStatus::Critical => write!(f, "CRITICAL"),
            SignalStatus::Alert => write!(f, "ALERT"),
            SignalStatus::Warn => write!(f, "WARN"),
            SignalStatus::Info => write!(f, "INFO"),
            SignalStatus::Ok => write!(f, "OK"),
            SignalStatus::Off => write!(f, "OFF"),
            SignalStatus::Unknown => write!(f, "UNK"),
        }
    }
}

/// One detection event reported by a remote agent. Never mutated after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Epoch seconds at which the agent observed the event.
    pub timestamp: i64,
    /// Agent-side detection category (e.g. "programs", "network").
    pub category: String,
    /// Human-readable detection name.
    pub name: String,
    /// Reported status.
    pub status: SignalStatus,
    /// Free-form detail string; may embed structured hints
    /// (`proc=…`, `via=…`, `pid=…`) or a JSON batch-summary payload.
    #[serde(default)]
    pub details: String,
    /// Stable device identifier.
    pub device_id: String,
    /// Optional friendly device name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Optional device IP address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ip: Option<String>,
    /// Optional network segment name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_name: Option<String>,
}

impl Signal {
    /// Convenience constructor for the common fields.
    pub fn new(
        timestamp: i64,
        device_id: impl Into<String>,
        category: impl Into<String>,
        name: impl Into<String>,
        status: SignalStatus,
        details: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            category: category.into(),
            name: name.into(),
            status,
            details: details.into(),
            device_id: device_id.into(),
            device_name: None,
            device_ip: None,
            segment_name: None,
        }
    }
}

/// A signal accepted into a section, carrying deduplication bookkeeping.
///
/// Owned exclusively by the per-section list it lives in; mutated in place
/// on repeats and escalations, removed on TTL expiry or consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDetection {
    /// Monotonic sequence plus random suffix, unique per process.
    pub id: String,
    pub timestamp: i64,
    pub category: String,
    pub name: String,
    pub status: SignalStatus,
    pub details: String,
    pub device_id: String,
    /// Section the detection was routed into.
    pub section: SectionKey,
    /// Deduplication identity. At most one live detection per unique key
    /// per section.
    pub unique_key: String,
    /// Normalized artifact fragment used for repeat detection.
    pub artifact: String,
    /// Resolved program identity, when the signal referenced a known
    /// executable or script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_identity: Option<String>,
    /// Timestamp of the first occurrence.
    pub first_seen: i64,
    /// Repeat counter; starts at 1.
    pub detections: u32,
}

impl StoredDetection {
    /// Age of the detection relative to `now`, in seconds.
    pub fn age_secs(&self, now: i64) -> i64 {
        now - self.timestamp
    }
}

/// Mutable per-device state, created on first signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub device_name: Option<String>,
    pub ip_address: Option<String>,
    /// Last time any signal was accepted for this device. Monotonically
    /// non-decreasing except when an explicit logout forces it into the
    /// past to mark the device offline.
    pub last_seen: i64,
    pub signal_count: u64,
    pub unique_detection_count: u64,
    /// Recent threat levels, bounded to the last [`HISTORY_CAP`] entries.
    pub historical_threat_levels: Vec<u8>,
    pub session_start: i64,
    pub session_end: i64,
    /// Threat score accumulated over the current session.
    pub threat_score: f64,
    pub logged_out: bool,
    /// Aggregate probability from the device's latest batch report,
    /// 0-100. Authoritative when present; never recomputed from counts.
    #[serde(default)]
    pub reported_probability: Option<f64>,
}

impl DeviceState {
    /// Creates device state from the first signal observed for a device.
    pub fn from_signal(signal: &Signal) -> Self {
        Self {
            device_id: signal.device_id.clone(),
            device_name: signal.device_name.clone(),
            ip_address: signal.device_ip.clone(),
            last_seen: signal.timestamp,
            signal_count: 0,
            unique_detection_count: 0,
            historical_threat_levels: Vec::new(),
            session_start: signal.timestamp,
            session_end: 0,
            threat_score: 0.0,
            logged_out: false,
            reported_probability: None,
        }
    }

    /// Pushes a threat level, dropping the oldest entry past the cap.
    pub fn push_threat_level(&mut self, level: u8) {
        if self.historical_threat_levels.len() >= HISTORY_CAP {
            self.historical_threat_levels.remove(0);
        }
        self.historical_threat_levels.push(level);
    }

    /// Refreshes identity fields opportunistically from a signal.
    pub fn refresh_identity(&mut self, signal: &Signal) {
        if signal.device_name.is_some() {
            self.device_name = signal.device_name.clone();
        }
        if signal.device_ip.is_some() {
            self.ip_address = signal.device_ip.clone();
        }
    }

    /// Whether the device is considered online at `now` given the
    /// heartbeat timeout.
    pub fn is_online(&self, now: i64, heartbeat_timeout_secs: i64) -> bool {
        !self.logged_out && now - self.last_seen <= heartbeat_timeout_secs
    }
}

/// Session log entry; append-only, never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub device_id: String,
    pub event_type: SessionEventType,
    pub timestamp: i64,
    pub session_start: i64,
    pub session_end: i64,
    pub duration_seconds: i64,
    pub final_threat_score: f64,
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventType {
    Login,
    Logout,
}

/// Counters for one category within an aggregate bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentCounts {
    pub critical: u32,
    pub alert: u32,
    pub warn: u32,
    pub total_points: u64,
}

/// One hourly or daily rollup bucket for a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatePoint {
    /// Start of the bucket, epoch seconds truncated to the hour or day.
    pub bucket_ts: i64,
    /// Per-category breakdowns.
    pub segments: HashMap<String, SegmentCounts>,
    pub total_points: u64,
    pub avg_score: f64,
    pub sample_count: u64,
    pub active_minutes: u32,
    /// Bitmask of minutes-within-hour that saw a sample; internal detail
    /// backing `active_minutes`.
    #[serde(default, skip_serializing)]
    pub minutes_mask: u64,
}

impl AggregatePoint {
    /// Creates an empty bucket starting at `bucket_ts`.
    pub fn new(bucket_ts: i64) -> Self {
        Self {
            bucket_ts,
            segments: HashMap::new(),
            total_points: 0,
            avg_score: 0.0,
            sample_count: 0,
            active_minutes: 0,
            minutes_mask: 0,
        }
    }
}

/// Entry returned from the device listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub device_name: Option<String>,
    pub ip_address: Option<String>,
    pub last_seen: i64,
    pub online: bool,
    pub signal_count: u64,
    pub unique_detection_count: u64,
    /// Threat level 0-100: the reported batch probability when present,
    /// else the durable daily aggregate, else a count-based fallback.
    pub threat_level: u8,
    /// Human-readable classification ("normal", "guarded", ...).
    pub classification: String,
    pub status_message: String,
}

/// Device listing response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceList {
    pub devices: Vec<DeviceSummary>,
    pub total: usize,
}

/// One section's live detections in a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectionView {
    pub items: Vec<StoredDetection>,
}

/// Point-in-time view of the live detection state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub server_time: i64,
    pub sections: HashMap<SectionKey, SectionView>,
}
