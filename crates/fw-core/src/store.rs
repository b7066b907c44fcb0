//! The signal store.
//!
//! Single entry point tying the engine together: routing, deduplication,
//! consolidation, session tracking, retention, aggregation and the
//! durable tier. Live state sits behind one `tokio::sync::Mutex` and no
//! await happens while it is held; durable writes run after the lock is
//! released and degrade to a warning when the backend misbehaves, so a
//! Redis outage never blocks or fails ingestion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::aggregate::AggregationEngine;
use crate::backend::Tier;
use crate::config::EngineConfig;
use crate::consolidate;
use crate::dedup::{self, DeduplicationEngine, Outcome};
use crate::keys;
use crate::model::{
    AggregatePoint, DeviceList, DeviceState, DeviceSummary, SectionView, SessionRecord, Signal,
    Snapshot, StoredDetection,
};
use crate::retention::RetentionManager;
use crate::router::{self, SectionKey};
use crate::session::SessionTracker;
use crate::summary::{self, BatchSummary};

/// Upper bound on volatile session-log entries.
const SESSION_LOG_CAP: usize = 1_000;

/// Durable session history kept per device.
const SESSION_HISTORY_CAP: usize = 100;

/// Pub/sub channel prefix for change notifications.
const CHANGE_CHANNEL_PREFIX: &str = "fleetwatch:changed";

/// Point-in-time ingestion statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub signals_received: u64,
    pub signals_accepted: u64,
    pub signals_discarded: u64,
    pub repeats: u64,
    pub escalations: u64,
    pub consolidations: u64,
    pub batch_reports: u64,
    pub durable_errors: u64,
    pub devices: usize,
    pub live_detections: usize,
}

#[derive(Debug, Default)]
struct IngestMetrics {
    received: AtomicU64,
    accepted: AtomicU64,
    discarded: AtomicU64,
    repeats: AtomicU64,
    escalations: AtomicU64,
    consolidations: AtomicU64,
    batch_reports: AtomicU64,
    durable_errors: AtomicU64,
}

impl IngestMetrics {
    fn record_durable_error(&self) {
        self.durable_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fw_durable_errors_total").increment(1);
    }
}

/// All state guarded by the store mutex. Plain data; every method that
/// touches it is synchronous.
struct VolatileState {
    sections: HashMap<SectionKey, Vec<StoredDetection>>,
    devices: HashMap<String, DeviceState>,
    sessions: Vec<SessionRecord>,
    dedup: DeduplicationEngine,
    aggregates: AggregationEngine,
    retention: RetentionManager,
}

/// What one accepted signal needs written to the durable tier. Collected
/// under the lock, flushed after it is released.
#[derive(Debug, Default)]
struct DurableSync {
    device_id: String,
    device_json: Option<String>,
    daily_total: Option<u64>,
    session_records: Vec<SessionRecord>,
    changed: bool,
}

/// The detection-signal store.
pub struct SignalStore {
    state: Mutex<VolatileState>,
    tracker: SessionTracker,
    tier: Tier,
    config: EngineConfig,
    metrics: IngestMetrics,
    seq: AtomicU64,
}

impl SignalStore {
    pub fn new(config: EngineConfig, tier: Tier) -> Self {
        let state = VolatileState {
            sections: SectionKey::all()
                .into_iter()
                .map(|s| (s, Vec::new()))
                .collect(),
            devices: HashMap::new(),
            sessions: Vec::new(),
            dedup: DeduplicationEngine::new(config.cooldown_secs),
            aggregates: AggregationEngine::new(config.hourly_window_hours),
            retention: RetentionManager::new(
                config.detection_ttl_secs,
                config.section_cap,
                config.max_devices,
                config.stale_after_secs,
                config.heartbeat_timeout_secs,
                config.sweep_interval_secs,
            ),
        };
        Self {
            state: Mutex::new(state),
            tracker: SessionTracker::new(config.heartbeat_timeout_secs),
            tier,
            config,
            metrics: IngestMetrics::default(),
            seq: AtomicU64::new(0),
        }
    }

    /// Volatile-only store with default settings; used by tests and
    /// deployments without Redis.
    pub fn volatile(config: EngineConfig) -> Self {
        Self::new(config, Tier::VolatileOnly)
    }

    /// Builds a store from configuration, connecting the durable tier
    /// when a Redis URL is configured and reachable.
    pub async fn from_config(config: EngineConfig) -> Self {
        let tier = Tier::from_config(&config).await;
        Self::new(config, tier)
    }

    fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:04}", seq, rand::random::<u16>() % 10_000)
    }

    /// Ingests one signal. Never fails: malformed payloads are logged
    /// and skipped, durable-tier trouble degrades to volatile-only.
    #[instrument(skip(self, signal), fields(device_id = %signal.device_id, category = %signal.category))]
    pub async fn add_signal(&self, signal: Signal) {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fw_signals_received_total").increment(1);

        if summary::is_batch_summary(&signal) {
            self.metrics.batch_reports.fetch_add(1, Ordering::Relaxed);
            return self.ingest_batch(signal).await;
        }

        let sync = {
            let mut guard = self.state.lock().await;
            self.apply(&mut guard, &signal)
        };
        self.flush_durable(sync).await;
    }

    /// Ingests a batch of signals in arrival order.
    pub async fn add_signals(&self, signals: Vec<Signal>) {
        for signal in signals {
            self.add_signal(signal).await;
        }
    }

    /// Expands a batch-summary envelope and ingests the embedded
    /// threats. The envelope itself still counts as a heartbeat, and its
    /// probability becomes the device's authoritative aggregate score.
    async fn ingest_batch(&self, envelope: Signal) {
        let parsed = BatchSummary::parse(&envelope.details);

        let mut heartbeat = envelope.clone();
        heartbeat.details = String::new();
        let sync = {
            let mut guard = self.state.lock().await;
            let mut sync = self.apply(&mut guard, &heartbeat);
            if let Some(batch) = &parsed {
                if let Some(dev) = guard.devices.get_mut(&envelope.device_id) {
                    dev.reported_probability = Some(batch.probability);
                    sync.device_json = serde_json::to_string(dev).ok();
                }
            }
            sync
        };
        self.flush_durable(sync).await;

        let Some(batch) = parsed else {
            // Malformed payload was already logged; nothing to fan out.
            return;
        };
        debug!(
            threats = batch.threats.len(),
            probability = batch.probability,
            "expanding batch report"
        );
        for threat in &batch.threats {
            let expanded = summary::threat_to_signal(&envelope, threat);
            let sync = {
                let mut guard = self.state.lock().await;
                self.apply(&mut guard, &expanded)
            };
            self.flush_durable(sync).await;
        }
    }

    /// Core ingestion step. Synchronous; runs entirely under the lock.
    fn apply(&self, st: &mut VolatileState, signal: &Signal) -> DurableSync {
        let now = signal.timestamp;
        let now_ms = now * 1_000;
        let mut sync = DurableSync {
            device_id: signal.device_id.clone(),
            ..DurableSync::default()
        };

        // Signals replayed from the past carry nothing the live state
        // can use; drop them before they disturb session bookkeeping.
        if let Some(dev) = st.devices.get(&signal.device_id) {
            let replayed = signal.timestamp < dev.last_seen
                || (dev.logged_out && signal.timestamp <= dev.session_end);
            if replayed {
                debug!(device_id = %signal.device_id, ts = signal.timestamp, "out-of-order signal dropped");
                self.metrics.discarded.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("fw_signals_discarded_total").increment(1);
                return sync;
            }
        }

        // Device state and session lifecycle come first; even discarded
        // signals count as liveness.
        let dev = st
            .devices
            .entry(signal.device_id.clone())
            .or_insert_with(|| DeviceState::from_signal(signal));
        dev.refresh_identity(signal);
        let session_records = self.tracker.observe(dev, signal);
        dev.signal_count += 1;

        if DeduplicationEngine::should_discard(signal) {
            self.metrics.discarded.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("fw_signals_discarded_total").increment(1);
        } else if signal.status.weight() > 0 {
            // Warn and above carry detection content; operational Info
            // signals only feed the device and session state above.
            self.accept(st, signal, now, now_ms, &mut sync);
        }

        if let Some(dev) = st.devices.get(&signal.device_id) {
            sync.device_json = serde_json::to_string(dev).ok();
        }
        sync.session_records = session_records;
        for record in &sync.session_records {
            st.sessions.push(record.clone());
        }
        if st.sessions.len() > SESSION_LOG_CAP {
            let excess = st.sessions.len() - SESSION_LOG_CAP;
            st.sessions.drain(..excess);
        }

        if st.retention.sweep_due(now) {
            self.sweep(st, now, now_ms, &mut sync);
        }

        sync
    }

    /// Detection path for signals that carry content.
    fn accept(
        &self,
        st: &mut VolatileState,
        signal: &Signal,
        now: i64,
        now_ms: i64,
        sync: &mut DurableSync,
    ) {
        let section = router::route(&signal.category, &signal.name);
        let identity = keys::program_identity(signal);
        let artifact = keys::artifact(signal);
        let unique_key = keys::unique_key(signal, section, identity.as_deref());

        // The unique key is global per device, so a live record may sit
        // in a different section than the one this signal routes to
        // (messaging merges do this).
        let existing = st.sections.iter().find_map(|(sec, l)| {
            l.iter()
                .position(|d| d.unique_key == unique_key)
                .map(|i| (*sec, i))
        });
        let existing_pair = existing.map(|(sec, i)| {
            let d = &st.sections[&sec][i];
            (d.artifact.clone(), d.category.clone())
        });

        let outcome = st.dedup.classify(
            &unique_key,
            &artifact,
            &signal.category,
            existing_pair.as_ref().map(|(a, c)| (a.as_str(), c.as_str())),
            now_ms,
        );

        let mut is_new_record = false;
        match (existing, outcome) {
            (Some((sec, i)), Outcome::Repeat) => {
                self.metrics.repeats.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("fw_signal_repeats_total").increment(1);
                // Keep-alive: refresh timestamp and status only. The
                // counter and details stay put so a single noisy source
                // cannot inflate them.
                if let Some(record) = st.sections.get_mut(&sec).and_then(|l| l.get_mut(i)) {
                    record.timestamp = now;
                    record.status = signal.status;
                }
            }
            (Some((sec, i)), _) => {
                // Escalated, or the cooldown lapsed; the record is
                // refreshed with the incoming content and counted.
                if outcome == Outcome::Escalated {
                    self.metrics.escalations.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("fw_signal_escalations_total").increment(1);
                }
                if let Some(record) = st.sections.get_mut(&sec).and_then(|l| l.get_mut(i)) {
                    record.detections += 1;
                    record.timestamp = now;
                    record.name = signal.name.clone();
                    record.category = signal.category.clone();
                    record.status = signal.status;
                    record.artifact = artifact.clone();
                    record.details = if keys::has_multiplier(&signal.details) {
                        signal.details.clone()
                    } else {
                        dedup::apply_multiplier(&signal.details, record.detections)
                    };
                }
            }
            (None, _) => {
                is_new_record = true;
                st.sections.entry(section).or_default().push(StoredDetection {
                    id: self.next_id(),
                    timestamp: now,
                    category: signal.category.clone(),
                    name: signal.name.clone(),
                    status: signal.status,
                    details: signal.details.clone(),
                    device_id: signal.device_id.clone(),
                    section,
                    unique_key: unique_key.clone(),
                    artifact: artifact.clone(),
                    program_identity: identity.clone(),
                    first_seen: now,
                    detections: 1,
                });
            }
        }

        // Cross-category consolidation: fold every record with the same
        // program identity into one, re-keyed under the canonical
        // program key in the programs section.
        if let Some(identity) = identity.as_deref() {
            if router::is_program_category(&signal.category) {
                let duplicates = st
                    .sections
                    .values()
                    .flat_map(|l| l.iter())
                    .filter(|d| {
                        d.device_id == signal.device_id
                            && d.program_identity.as_deref() == Some(identity)
                    })
                    .count();
                if duplicates > 1 {
                    self.metrics.consolidations.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("fw_consolidations_total").increment(1);
                    if let Some((sec, i)) =
                        consolidate::find_program_record(&st.sections, &signal.device_id, identity)
                    {
                        if let Some(base) = st.sections.get_mut(&sec).map(|l| l.remove(i)) {
                            let mut merged = consolidate::merge_program_records(
                                &mut st.sections,
                                &signal.device_id,
                                identity,
                                base,
                            );
                            merged.section = SectionKey::Programs;
                            merged.name = signal.name.clone();
                            merged.timestamp = now;
                            st.sections
                                .entry(SectionKey::Programs)
                                .or_default()
                                .push(merged);
                        }
                    }
                }
            }
        }

        self.metrics.accepted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fw_signals_accepted_total").increment(1);

        if let Some(dev) = st.devices.get_mut(&signal.device_id) {
            if is_new_record {
                dev.unique_detection_count += 1;
            }
            dev.threat_score += signal.status.weight() as f64;
            dev.push_threat_level(dev.threat_score.min(100.0) as u8);
        }

        // System-section records are operational noise; they never feed
        // the hourly buckets.
        if section != SectionKey::System {
            st.aggregates
                .record(&signal.device_id, section.as_str(), signal.status, now);
        }
        sync.daily_total = Some(st.aggregates.total_points(&signal.device_id));
        sync.changed = true;
    }

    /// Full retention sweep: TTL and cap pruning, cooldown cleanup,
    /// silent-session closure, device eviction, aggregate pruning.
    fn sweep(&self, st: &mut VolatileState, now: i64, now_ms: i64, sync: &mut DurableSync) {
        let removed = st.retention.prune_sections(&mut st.sections, now);
        for key in &removed {
            st.dedup.forget(key);
        }
        st.dedup.prune(now_ms);

        for dev in st.devices.values_mut() {
            if let Some(record) = self.tracker.sweep(dev, now) {
                st.sessions.push(record.clone());
                sync.session_records.push(record);
            }
        }

        let evicted = st.retention.evict_devices(&mut st.devices, now);
        if !removed.is_empty() || !evicted.is_empty() {
            sync.changed = true;
        }
        st.aggregates.prune(now);
    }

    /// Flushes durable writes for one ingested signal. Failures are
    /// logged and counted; volatile state is already committed.
    async fn flush_durable(&self, sync: DurableSync) {
        let Some(backend) = self.tier.durable() else {
            return;
        };
        let ttl = Duration::from_secs(self.config.record_ttl_secs);

        if let Some(device_json) = &sync.device_json {
            if let Err(err) = backend
                .hash_set("devices", &sync.device_id, device_json, ttl)
                .await
            {
                warn!(error = %err, device_id = %sync.device_id, "durable device write failed");
                self.metrics.record_durable_error();
            }
        }

        if let Some(total) = sync.daily_total {
            let day = Utc::now().format("%Y-%m-%d").to_string();
            let key = format!("daily:{}:{}", sync.device_id, day);
            if let Err(err) = backend.set(&key, &total.to_string(), ttl).await {
                warn!(error = %err, device_id = %sync.device_id, "durable rollup write failed");
                self.metrics.record_durable_error();
            }
        }

        for record in &sync.session_records {
            let key = format!("sessions:{}", record.device_id);
            match serde_json::to_string(record) {
                Ok(json) => {
                    if let Err(err) = backend
                        .zadd(&key, &json, record.timestamp as f64, ttl)
                        .await
                    {
                        warn!(error = %err, device_id = %record.device_id, "durable session write failed");
                        self.metrics.record_durable_error();
                    } else if let Err(err) = backend.ztrim(&key, SESSION_HISTORY_CAP).await {
                        warn!(error = %err, "session history trim failed");
                        self.metrics.record_durable_error();
                    }
                }
                Err(err) => {
                    warn!(error = %err, "session record failed to encode");
                }
            }
        }

        if sync.changed {
            let device_channel = format!("{CHANGE_CHANNEL_PREFIX}:{}", sync.device_id);
            let all_channel = format!("{CHANGE_CHANNEL_PREFIX}:all");
            for channel in [device_channel.as_str(), all_channel.as_str()] {
                if let Err(err) = backend.publish(channel, &sync.device_id).await {
                    warn!(error = %err, channel, "change notification failed");
                    self.metrics.record_durable_error();
                }
            }
        }
    }

    /// Live detections for one device, or for all online devices.
    ///
    /// An offline device yields empty sections rather than stale data.
    pub async fn get_snapshot(&self, device_id: Option<&str>, now: i64) -> Snapshot {
        let st = self.state.lock().await;
        let timeout = self.config.heartbeat_timeout_secs as i64;

        let visible = |d: &StoredDetection| match device_id {
            Some(id) => {
                d.device_id == id
                    && st
                        .devices
                        .get(id)
                        .map(|dev| dev.is_online(now, timeout))
                        .unwrap_or(false)
            }
            None => st
                .devices
                .get(&d.device_id)
                .map(|dev| dev.is_online(now, timeout))
                .unwrap_or(false),
        };

        let mut sections = HashMap::new();
        for section in SectionKey::all() {
            let items: Vec<StoredDetection> = st
                .sections
                .get(&section)
                .map(|l| l.iter().filter(|d| visible(d)).cloned().collect())
                .unwrap_or_default();
            sections.insert(section, SectionView { items });
        }
        Snapshot {
            server_time: now,
            sections,
        }
    }

    /// Device listing ordered by recency. Threat levels come from the
    /// device's reported batch probability when one exists, then the
    /// durable daily rollup, then a count-based fallback.
    pub async fn get_devices(&self, now: i64) -> DeviceList {
        let devices: Vec<DeviceState> = {
            let st = self.state.lock().await;
            let mut devs: Vec<DeviceState> = st.devices.values().cloned().collect();
            devs.sort_by_key(|d| std::cmp::Reverse(d.last_seen));
            devs
        };

        let mut summaries = Vec::with_capacity(devices.len());
        for dev in devices {
            let threat_level = match dev.reported_probability {
                Some(p) => p.clamp(0.0, 100.0).round() as u8,
                None => {
                    let points = self
                        .durable_daily_points(&dev.device_id, now)
                        .await
                        .unwrap_or_else(|| dev.unique_detection_count.saturating_mul(10));
                    points.min(100) as u8
                }
            };
            let (classification, status_message) = classify_threat(threat_level);
            summaries.push(DeviceSummary {
                online: dev.is_online(now, self.config.heartbeat_timeout_secs as i64),
                device_id: dev.device_id,
                device_name: dev.device_name,
                ip_address: dev.ip_address,
                last_seen: dev.last_seen,
                signal_count: dev.signal_count,
                unique_detection_count: dev.unique_detection_count,
                threat_level,
                classification: classification.to_string(),
                status_message: status_message.to_string(),
            });
        }
        DeviceList {
            total: summaries.len(),
            devices: summaries,
        }
    }

    async fn durable_daily_points(&self, device_id: &str, now: i64) -> Option<u64> {
        let backend = self.tier.durable()?;
        let day = Utc
            .timestamp_opt(now, 0)
            .single()?
            .format("%Y-%m-%d")
            .to_string();
        let key = format!("daily:{device_id}:{day}");
        match backend.get(&key).await {
            Ok(value) => value.and_then(|v| v.parse().ok()),
            Err(err) => {
                warn!(error = %err, device_id, "durable rollup read failed");
                self.metrics.record_durable_error();
                None
            }
        }
    }

    /// Hourly aggregate buckets for a device over the last `hours`.
    ///
    /// `minutes_override` substitutes a caller-supplied active-minutes
    /// figure, such as one read from a durable daily rollup.
    pub async fn get_hourly_aggregates(
        &self,
        device_id: &str,
        hours: u64,
        now: i64,
        minutes_override: Option<u32>,
    ) -> Vec<AggregatePoint> {
        let st = self.state.lock().await;
        st.aggregates.query(device_id, hours, now, minutes_override)
    }

    /// Session history for a device since `since`, durable-first.
    pub async fn get_sessions(&self, device_id: &str, since: i64) -> Vec<SessionRecord> {
        if let Some(backend) = self.tier.durable() {
            let key = format!("sessions:{device_id}");
            match backend.zrange_by_score(&key, since as f64, f64::MAX).await {
                Ok(entries) => {
                    let mut records: Vec<SessionRecord> = entries
                        .iter()
                        .filter_map(|e| serde_json::from_str(e).ok())
                        .collect();
                    records.sort_by_key(|r| r.timestamp);
                    return records;
                }
                Err(err) => {
                    warn!(error = %err, device_id, "durable session read failed");
                    self.metrics.record_durable_error();
                }
            }
        }

        let st = self.state.lock().await;
        st.sessions
            .iter()
            .filter(|r| r.device_id == device_id && r.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Current ingestion statistics.
    pub async fn stats(&self) -> StoreStats {
        let (devices, live_detections) = {
            let st = self.state.lock().await;
            (
                st.devices.len(),
                st.sections.values().map(|l| l.len()).sum(),
            )
        };
        StoreStats {
            signals_received: self.metrics.received.load(Ordering::Relaxed),
            signals_accepted: self.metrics.accepted.load(Ordering::Relaxed),
            signals_discarded: self.metrics.discarded.load(Ordering::Relaxed),
            repeats: self.metrics.repeats.load(Ordering::Relaxed),
            escalations: self.metrics.escalations.load(Ordering::Relaxed),
            consolidations: self.metrics.consolidations.load(Ordering::Relaxed),
            batch_reports: self.metrics.batch_reports.load(Ordering::Relaxed),
            durable_errors: self.metrics.durable_errors.load(Ordering::Relaxed),
            devices,
            live_detections,
        }
    }

    pub fn tier(&self) -> &Tier {
        &self.tier
    }
}

fn classify_threat(level: u8) -> (&'static str, &'static str) {
    match level {
        0..=19 => ("normal", "No significant activity"),
        20..=39 => ("guarded", "Low-level detections present"),
        40..=69 => ("elevated", "Repeated detections, review recommended"),
        70..=89 => ("severe", "Sustained suspicious activity"),
        _ => ("critical", "Active threat indicators"),
    }
}
