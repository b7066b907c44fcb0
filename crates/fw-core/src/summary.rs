//! Batch-summary payloads.
//!
//! Agents that scan in bulk send one Info signal whose details field is
//! a JSON document summarizing the scan: an overall probability, severity
//! counts, and the individual threats found. The engine fans the embedded
//! threats back out into ordinary signals so they flow through the same
//! dedup and consolidation path as live detections.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{Signal, SignalStatus};

/// Severity tallies reported with a batch scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeverityCounts {
    #[serde(default)]
    pub critical: u32,
    #[serde(default)]
    pub alert: u32,
    #[serde(default)]
    pub warn: u32,
    #[serde(default)]
    pub info: u32,
}

/// One threat embedded in a batch summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryThreat {
    pub category: String,
    pub name: String,
    pub status: SignalStatus,
    #[serde(default)]
    pub details: String,
}

/// Parsed batch-summary document.
///
/// Older agents send the threat list under `findings`; both spellings
/// parse into the same field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    #[serde(default)]
    pub probability: f64,
    #[serde(default)]
    pub counts: SeverityCounts,
    #[serde(default, alias = "findings")]
    pub threats: Vec<SummaryThreat>,
}

impl BatchSummary {
    /// Parses a details string as a batch summary. Malformed JSON is
    /// logged and swallowed; the caller drops the signal.
    pub fn parse(details: &str) -> Option<BatchSummary> {
        let trimmed = details.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        match serde_json::from_str::<BatchSummary>(trimmed) {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(error = %err, "malformed batch summary payload, skipping");
                None
            }
        }
    }
}

/// Whether a signal looks like a batch-summary carrier.
pub fn is_batch_summary(signal: &Signal) -> bool {
    signal.status == SignalStatus::Info
        && signal.name.to_ascii_lowercase().contains("batch report")
        && signal.details.trim_start().starts_with('{')
}

/// Expands one embedded threat into a standalone signal carrying the
/// envelope's device identity and timestamp.
pub fn threat_to_signal(envelope: &Signal, threat: &SummaryThreat) -> Signal {
    Signal {
        timestamp: envelope.timestamp,
        category: threat.category.clone(),
        name: threat.name.clone(),
        status: threat.status,
        details: threat.details.clone(),
        device_id: envelope.device_id.clone(),
        device_name: envelope.device_name.clone(),
        device_ip: envelope.device_ip.clone(),
        segment_name: envelope.segment_name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(details: &str) -> Signal {
        Signal::new(500, "d1", "system", "Batch Report", SignalStatus::Info, details)
    }

    #[test]
    fn test_parse_full_payload() {
        let json = r#"{
            "probability": 0.82,
            "counts": {"critical": 1, "warn": 2},
            "threats": [
                {"category": "programs", "name": "miner.exe", "status": "CRITICAL", "details": "proc=miner.exe"},
                {"category": "network", "name": "dns:tunnel x.com", "status": "WARN"}
            ]
        }"#;
        let summary = BatchSummary::parse(json).expect("payload should parse");
        assert!((summary.probability - 0.82).abs() < 1e-9);
        assert_eq!(summary.counts.critical, 1);
        assert_eq!(summary.threats.len(), 2);
        assert_eq!(summary.threats[0].status, SignalStatus::Critical);
        assert_eq!(summary.threats[1].details, "");
    }

    #[test]
    fn test_parse_legacy_findings_field() {
        let json = r#"{"findings": [{"category": "files", "name": "dropper", "status": "ALERT"}]}"#;
        let summary = BatchSummary::parse(json).expect("legacy payload should parse");
        assert_eq!(summary.threats.len(), 1);
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(BatchSummary::parse("just some text").is_none());
        assert!(BatchSummary::parse("{not json").is_none());
    }

    #[test]
    fn test_carrier_detection() {
        assert!(is_batch_summary(&envelope(r#"{"threats": []}"#)));
        assert!(!is_batch_summary(&envelope("plain text")));
        let mut not_info = envelope(r#"{"threats": []}"#);
        not_info.status = SignalStatus::Warn;
        assert!(!is_batch_summary(&not_info));
    }

    #[test]
    fn test_fan_out_inherits_envelope_identity() {
        let mut env = envelope("{}");
        env.device_name = Some("workstation-7".to_string());
        let threat = SummaryThreat {
            category: "programs".to_string(),
            name: "miner.exe".to_string(),
            status: SignalStatus::Critical,
            details: "proc=miner.exe".to_string(),
        };
        let signal = threat_to_signal(&env, &threat);
        assert_eq!(signal.device_id, "d1");
        assert_eq!(signal.timestamp, 500);
        assert_eq!(signal.device_name.as_deref(), Some("workstation-7"));
        assert_eq!(signal.status, SignalStatus::Critical);
    }
}
