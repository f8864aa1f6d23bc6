use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Millisecond UTC source consumed by the store.
///
/// On constrained gateways UTC only becomes trustworthy after a time sync;
/// `utc_established` gates periodic-sample writes until then.
pub trait TimeSource: Send + Sync {
    fn now_utc_ms(&self) -> u64;
    fn utc_established(&self) -> bool;
}

/// Wall-clock source backed by the OS clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_utc_ms(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }

    fn utc_established(&self) -> bool {
        true
    }
}

/// Settable clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    ms: AtomicU64,
    established: AtomicBool,
}

impl ManualClock {
    pub fn new(ms: u64) -> Self {
        Self {
            ms: AtomicU64::new(ms),
            established: AtomicBool::new(true),
        }
    }

    pub fn unestablished() -> Self {
        let clock = Self::new(0);
        clock.established.store(false, Ordering::SeqCst);
        clock
    }

    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn establish(&self) {
        self.established.store(true, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_utc_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }

    fn utc_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }
}
