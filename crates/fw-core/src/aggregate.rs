//! Hourly aggregation of accepted signals.
//!
//! Each device accumulates a rolling window of hourly buckets keyed by
//! the truncated epoch hour. Buckets track per-category severity counts,
//! weighted point totals, the average points per sample and the number
//! of distinct minutes that saw activity. Activity is tracked as a
//! 60-bit mask per bucket so memory stays flat no matter how chatty a
//! device is.

use std::collections::{BTreeMap, HashMap};

use crate::model::{AggregatePoint, SignalStatus};

/// Seconds per hourly bucket.
const BUCKET_SECS: i64 = 3_600;

#[derive(Debug, Default)]
pub struct AggregationEngine {
    /// Per-device buckets, ordered by bucket start.
    buckets: HashMap<String, BTreeMap<i64, AggregatePoint>>,
    window_hours: i64,
}

impl AggregationEngine {
    pub fn new(window_hours: u64) -> Self {
        Self {
            buckets: HashMap::new(),
            window_hours: window_hours as i64,
        }
    }

    /// Truncates a timestamp to its bucket start.
    pub fn bucket_of(ts: i64) -> i64 {
        ts - ts.rem_euclid(BUCKET_SECS)
    }

    /// Records one accepted signal into the device's current bucket.
    pub fn record(&mut self, device_id: &str, segment: &str, status: SignalStatus, ts: i64) {
        let bucket_ts = Self::bucket_of(ts);
        let point = self
            .buckets
            .entry(device_id.to_string())
            .or_default()
            .entry(bucket_ts)
            .or_insert_with(|| AggregatePoint::new(bucket_ts));

        let seg = point.segments.entry(segment.to_string()).or_default();
        match status {
            SignalStatus::Critical => seg.critical += 1,
            SignalStatus::Alert => seg.alert += 1,
            SignalStatus::Warn => seg.warn += 1,
            _ => {}
        }
        let weight = status.weight() as u64;
        seg.total_points += weight;
        point.total_points += weight;

        point.sample_count += 1;
        point.avg_score = point.total_points as f64 / point.sample_count as f64;

        let minute = ts.rem_euclid(BUCKET_SECS) / 60;
        point.minutes_mask |= 1u64 << minute;
        point.active_minutes = point.minutes_mask.count_ones();
    }

    /// Drops buckets older than the rolling window.
    pub fn prune(&mut self, now: i64) {
        let cutoff = Self::bucket_of(now) - self.window_hours * BUCKET_SECS;
        for device in self.buckets.values_mut() {
            *device = device.split_off(&cutoff);
        }
        self.buckets.retain(|_, b| !b.is_empty());
    }

    /// Returns the device's buckets covering the last `hours` hours, in
    /// ascending order. `minutes_override` replaces the computed
    /// active-minutes figure when the caller has a better source, such
    /// as a durable daily rollup.
    pub fn query(
        &self,
        device_id: &str,
        hours: u64,
        now: i64,
        minutes_override: Option<u32>,
    ) -> Vec<AggregatePoint> {
        let hours = (hours as i64).min(self.window_hours).max(1);
        let cutoff = Self::bucket_of(now) - (hours - 1) * BUCKET_SECS;
        let mut out: Vec<AggregatePoint> = self
            .buckets
            .get(device_id)
            .map(|b| b.range(cutoff..).map(|(_, p)| p.clone()).collect())
            .unwrap_or_default();
        if let Some(minutes) = minutes_override {
            for point in &mut out {
                point.active_minutes = minutes;
            }
        }
        out
    }

    /// Sum of weighted points across a device's retained buckets.
    pub fn total_points(&self, device_id: &str) -> u64 {
        self.buckets
            .get(device_id)
            .map(|b| b.values().map(|p| p.total_points).sum())
            .unwrap_or(0)
    }
}
