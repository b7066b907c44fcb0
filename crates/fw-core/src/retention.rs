//! Retention: TTL expiry, section caps and device eviction.
//!
//! Sweeps are piggybacked on ingestion rather than run from a timer, and
//! throttled so a burst of signals does not re-scan the whole state on
//! every arrival.

use std::collections::HashMap;

use tracing::debug;

use crate::model::{DeviceState, StoredDetection};
use crate::router::SectionKey;

#[derive(Debug)]
pub struct RetentionManager {
    ttl_secs: i64,
    section_cap: usize,
    max_devices: usize,
    stale_after_secs: i64,
    heartbeat_timeout_secs: i64,
    sweep_interval_secs: i64,
    last_sweep: i64,
}

impl RetentionManager {
    pub fn new(
        ttl_secs: u64,
        section_cap: usize,
        max_devices: usize,
        stale_after_secs: u64,
        heartbeat_timeout_secs: u64,
        sweep_interval_secs: u64,
    ) -> Self {
        Self {
            ttl_secs: ttl_secs as i64,
            section_cap,
            max_devices,
            stale_after_secs: stale_after_secs as i64,
            heartbeat_timeout_secs: heartbeat_timeout_secs as i64,
            sweep_interval_secs: sweep_interval_secs as i64,
            last_sweep: 0,
        }
    }

    /// Whether a full sweep is due; stamps the throttle when it is.
    pub fn sweep_due(&mut self, now: i64) -> bool {
        if now - self.last_sweep >= self.sweep_interval_secs {
            self.last_sweep = now;
            true
        } else {
            false
        }
    }

    /// Drops expired detections and enforces the per-section cap,
    /// oldest-first. Returns the unique keys of removed records so
    /// cooldown state can be cleared with them.
    pub fn prune_sections(
        &self,
        sections: &mut HashMap<SectionKey, Vec<StoredDetection>>,
        now: i64,
    ) -> Vec<String> {
        let mut removed = Vec::new();
        for list in sections.values_mut() {
            list.retain(|d| {
                if d.age_secs(now) > self.ttl_secs {
                    removed.push(d.unique_key.clone());
                    false
                } else {
                    true
                }
            });

            if list.len() > self.section_cap {
                list.sort_by_key(|d| d.timestamp);
                let excess = list.len() - self.section_cap;
                for d in list.drain(..excess) {
                    removed.push(d.unique_key);
                }
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "pruned detections");
        }
        removed
    }

    /// Evicts devices past the registry bound.
    ///
    /// The most recently seen devices are always kept. Beyond that, a
    /// device is dropped once it has gone stale, or once it is both
    /// offline and logged out.
    pub fn evict_devices(
        &self,
        devices: &mut HashMap<String, DeviceState>,
        now: i64,
    ) -> Vec<String> {
        if devices.len() <= self.max_devices {
            return Vec::new();
        }

        let mut by_recency: Vec<(String, i64)> = devices
            .iter()
            .map(|(id, d)| (id.clone(), d.last_seen))
            .collect();
        by_recency.sort_by_key(|(_, seen)| std::cmp::Reverse(*seen));
        let keep: std::collections::HashSet<String> = by_recency
            .iter()
            .take(self.max_devices)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = Vec::new();
        devices.retain(|id, dev| {
            if keep.contains(id) {
                return true;
            }
            let stale = now - dev.last_seen > self.stale_after_secs;
            let offline = !dev.is_online(now, self.heartbeat_timeout_secs);
            if stale || (offline && dev.logged_out) {
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted devices");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Signal, SignalStatus};

    fn manager() -> RetentionManager {
        RetentionManager::new(600, 3, 2, 1_800, 120, 30)
    }

    fn detection(key: &str, ts: i64) -> StoredDetection {
        StoredDetection {
            id: key.to_string(),
            timestamp: ts,
            category: "programs".to_string(),
            name: key.to_string(),
            status: SignalStatus::Warn,
            details: String::new(),
            device_id: "d1".to_string(),
            section: SectionKey::Programs,
            unique_key: key.to_string(),
            artifact: "a".to_string(),
            program_identity: None,
            first_seen: ts,
            detections: 1,
        }
    }

    fn device(id: &str, last_seen: i64, logged_out: bool) -> DeviceState {
        let signal = Signal::new(last_seen, id, "system", "x", SignalStatus::Info, "");
        let mut dev = DeviceState::from_signal(&signal);
        dev.logged_out = logged_out;
        dev
    }

    #[test]
    fn test_sweep_throttle() {
        let mut m = manager();
        assert!(m.sweep_due(100));
        assert!(!m.sweep_due(110));
        assert!(m.sweep_due(130));
    }

    #[test]
    fn test_ttl_expiry() {
        let m = manager();
        let mut sections = HashMap::new();
        sections.insert(
            SectionKey::Programs,
            vec![detection("old", 0), detection("fresh", 500)],
        );
        let removed = m.prune_sections(&mut sections, 700);
        assert_eq!(removed, vec!["old".to_string()]);
        assert_eq!(sections[&SectionKey::Programs].len(), 1);
    }

    #[test]
    fn test_cap_drops_oldest_first() {
        let m = manager();
        let mut sections = HashMap::new();
        sections.insert(
            SectionKey::Programs,
            vec![
                detection("k3", 300),
                detection("k1", 100),
                detection("k4", 400),
                detection("k2", 200),
            ],
        );
        let removed = m.prune_sections(&mut sections, 450);
        assert_eq!(removed, vec!["k1".to_string()]);
        let keys: Vec<_> = sections[&SectionKey::Programs]
            .iter()
            .map(|d| d.unique_key.as_str())
            .collect();
        assert_eq!(keys, vec!["k2", "k3", "k4"]);
    }

    #[test]
    fn test_no_eviction_under_bound() {
        let m = manager();
        let mut devices = HashMap::new();
        devices.insert("a".to_string(), device("a", 0, true));
        devices.insert("b".to_string(), device("b", 0, true));
        assert!(m.evict_devices(&mut devices, 10_000).is_empty());
    }

    #[test]
    fn test_evicts_stale_beyond_bound() {
        let m = manager();
        let mut devices = HashMap::new();
        devices.insert("a".to_string(), device("a", 9_000, false));
        devices.insert("b".to_string(), device("b", 8_000, false));
        devices.insert("c".to_string(), device("c", 1_000, false));
        let evicted = m.evict_devices(&mut devices, 10_000);
        assert_eq!(evicted, vec!["c".to_string()]);
        assert_eq!(devices.len(), 2);
    }

    #[test]
    fn test_offline_but_recent_device_kept() {
        let m = manager();
        let mut devices = HashMap::new();
        devices.insert("a".to_string(), device("a", 9_900, false));
        devices.insert("b".to_string(), device("b", 9_800, false));
        // Offline but not stale and not logged out.
        devices.insert("c".to_string(), device("c", 9_000, false));
        assert!(m.evict_devices(&mut devices, 10_000).is_empty());
        assert_eq!(devices.len(), 3);
    }

    #[test]
    fn test_logged_out_offline_device_evicted() {
        let m = manager();
        let mut devices = HashMap::new();
        devices.insert("a".to_string(), device("a", 9_900, false));
        devices.insert("b".to_string(), device("b", 9_800, false));
        devices.insert("c".to_string(), device("c", 9_000, true));
        let evicted = m.evict_devices(&mut devices, 10_000);
        assert_eq!(evicted, vec!["c".to_string()]);
    }
}
