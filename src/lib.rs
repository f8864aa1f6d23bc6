//! Tiered RAM/disk sample buffer for telemetry gateways.
//!
//! Sensors append periodic samples (TSD) or timestamped events (EVT) into a
//! fixed-size sector pool; per-destination cursors stream them oldest-first
//! with read/acknowledge/erase cycles; under memory pressure cold sectors
//! spool to checksummed per-destination files, journaled so migration and
//! erasure survive crashes; a power event triggers a bounded emergency flush
//! replayed on the next boot.
//!
//! The crate is deliberately free of uploader, transport and config-file
//! concerns: callers own the sensor handles and states, inject the clock, and
//! drive recovery per sensor.

pub mod clock;

mod chain;
mod codec;
mod config;
mod error;
mod pending;
mod pool;
mod power;
mod spool;
mod store;
mod types;

pub use clock::{ManualClock, SystemClock, TimeSource};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use store::{SampleStore, StoreStats};
pub use types::{
    Destination, RecordKind, Sample, SectorId, SensorHandle, SensorState, DEST_COUNT, NULL_SECTOR,
    SECTOR_SIZE,
};
