//! # fw-core
//!
//! Detection-signal ingestion and aggregation engine for Fleetwatch.
//!
//! This crate ingests raw detection signals from device agents and turns
//! them into a deduplicated, consolidated live view per device, with
//! session tracking, TTL-based retention, hourly aggregates and an
//! optional Redis-backed durable tier.

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod consolidate;
pub mod dedup;
pub mod keys;
pub mod model;
pub mod retention;
pub mod router;
pub mod session;
pub mod store;
pub mod summary;

pub use backend::{
    BackendError, BackendResult, DurableBackend, MemoryBackend, RedisBackend, RedisBackendConfig,
    Tier,
};
pub use config::EngineConfig;
pub use dedup::{DeduplicationEngine, Outcome};
pub use model::{
    AggregatePoint, DeviceList, DeviceState, DeviceSummary, SectionView, SessionEventType,
    SessionRecord, Signal, SignalStatus, Snapshot, StoredDetection,
};
pub use router::SectionKey;
pub use session::SessionTracker;
pub use store::{SignalStore, StoreStats};
pub use summary::{BatchSummary, SeverityCounts, SummaryThreat};
