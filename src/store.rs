#[cfg(test)]
mod tests;

use crate::chain::{self, ChainCtx};
use crate::clock::TimeSource;
use crate::codec;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::pending;
use crate::pool::SectorPool;
use crate::power;
use crate::spool::{self, DiskState};
use crate::types::{
    DestCursor, Destination, RecordKind, Sample, SensorHandle, SensorState, NULL_SECTOR,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Pool and spooler counters, tracked continuously.
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    pub total_sectors: u32,
    pub free_sectors: u32,
    pub tsd_sectors: u32,
    pub evt_sectors: u32,
    pub active_sensors: u32,
    pub efficiency_pct: u32,
    pub alloc_failures: u64,
}

pub(crate) struct StoreInner {
    pub pool: SectorPool,
    pub disk: Option<DiskState>,
    pub config: StoreConfig,
    pub draining: bool,
    pub active_sensors: u32,
}

/// Tiered sample buffer: fixed RAM sector pool with per-sensor chains,
/// per-destination read/acknowledge cursors, and (when a disk root is
/// configured) journaled spooling to per-destination directories.
///
/// The store is stateless with respect to sensor identity: every operation
/// takes the caller-owned `SensorHandle` and `SensorState`. One store-wide
/// mutex serialises pool and disk mutations; the `&mut SensorState` borrow
/// serialises per-sensor state.
pub struct SampleStore {
    inner: Mutex<StoreInner>,
    clock: Arc<dyn TimeSource>,
}

impl SampleStore {
    /// Builds the pool, creates the per-destination spool directories and
    /// replays the journal. Call once at boot, then `configure_sensor` +
    /// `recover_sensor` per sensor.
    pub fn open(config: StoreConfig, clock: Arc<dyn TimeSource>) -> StoreResult<Self> {
        config.validate()?;
        let disk = match &config.disk_root {
            Some(root) => Some(
                DiskState::open(root, config.keep_free_bytes)
                    .map_err(|err| StoreError::Init(err.to_string()))?,
            ),
            None => None,
        };
        let pool = SectorPool::new(config.pool_sectors);
        Ok(Self {
            inner: Mutex::new(StoreInner {
                pool,
                disk,
                config,
                draining: false,
                active_sensors: 0,
            }),
            clock,
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// False until the clock reports UTC established; TSD writes are refused
    /// with `Timeout` before that.
    pub fn is_ready(&self) -> bool {
        self.clock.utc_established()
    }

    /// Activates `dest` for this sensor. The destination's cursor starts at
    /// the current write frontier: records written from now on are broadcast
    /// to it. Idempotent.
    pub fn configure_sensor(
        &self,
        dest: Destination,
        _sensor: &SensorHandle,
        state: &mut SensorState,
    ) -> StoreResult<()> {
        if state.is_active(dest) {
            return Ok(());
        }
        let mut guard = self.lock();
        if state.dest_mask == 0 {
            guard.active_sensors += 1;
        }
        state.dest_mask |= dest.bit();
        let frontier = (state.tail, state.tail_records);
        let cursor = state.cursor_mut(dest);
        cursor.read_head = frontier.0;
        cursor.read_rec = frontier.1;
        cursor.pending_start = frontier.0;
        cursor.pending_start_rec = frontier.1;
        cursor.pending_count = 0;
        Ok(())
    }

    /// Re-enables a destination after `deactivate_sensor`.
    pub fn activate_sensor(
        &self,
        dest: Destination,
        sensor: &SensorHandle,
        state: &mut SensorState,
    ) -> StoreResult<()> {
        self.configure_sensor(dest, sensor, state)
    }

    /// Removes `dest` from the broadcast set, releasing every sector no
    /// remaining destination needs.
    pub fn deactivate_sensor(
        &self,
        dest: Destination,
        _sensor: &SensorHandle,
        state: &mut SensorState,
    ) -> StoreResult<()> {
        if !state.is_active(dest) {
            return Ok(());
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut released: Vec<crate::types::SectorId> = Vec::new();
        {
            let mut ctx = ChainCtx {
                pool: &mut inner.pool,
                disk: inner.disk.as_mut(),
            };
            let mut prev = NULL_SECTOR;
            let mut id = state.head;
            while id != NULL_SECTOR {
                let next = ctx.next_of(id)?;
                ctx.clear_pending(id, dest)?;
                let mask = ctx.clear_dest_bit(id, dest)?;
                if mask == 0 {
                    if prev == NULL_SECTOR {
                        state.head = next;
                    } else {
                        ctx.set_next(prev, next)?;
                    }
                    if id == state.tail {
                        state.tail = prev;
                        if prev == NULL_SECTOR {
                            state.head = NULL_SECTOR;
                            state.tail_records = 0;
                        } else {
                            state.tail_records = ctx.fill(prev)?;
                        }
                    }
                    ctx.release(id)?;
                    released.push(id);
                } else {
                    prev = id;
                }
                id = next;
            }
        }
        // A destination configured at the old frontier may still reference a
        // sector only the departing destination owned; park it at the new
        // frontier (it can have nothing pending there).
        let frontier = (state.tail, state.tail_records);
        for slot in Destination::ALL {
            if slot == dest || !state.is_active(slot) {
                continue;
            }
            let cursor = state.cursor_mut(slot);
            if released.contains(&cursor.read_head) || released.contains(&cursor.pending_start) {
                cursor.read_head = frontier.0;
                cursor.read_rec = frontier.1;
                cursor.pending_start = frontier.0;
                cursor.pending_start_rec = frontier.1;
                cursor.pending_count = 0;
            }
        }
        *state.cursor_mut(dest) = DestCursor::cleared();
        state.dest_mask &= !dest.bit();
        if state.dest_mask == 0 {
            inner.active_sensors = inner.active_sensors.saturating_sub(1);
        }
        Ok(())
    }

    /// Appends one periodic sample. The sector header is stamped from the
    /// clock when a fresh tail sector is allocated; record *i* of a sector
    /// reads back at `first_utc + i * sample_period_ms`.
    pub fn write_tsd(
        &self,
        dest: Destination,
        sensor: &SensorHandle,
        state: &mut SensorState,
        value: u32,
    ) -> StoreResult<()> {
        if sensor.kind() != RecordKind::Tsd || !state.is_active(dest) {
            return Err(StoreError::InvalidParameter);
        }
        if !self.clock.utc_established() {
            return Err(StoreError::Timeout);
        }
        let now_ms = self.clock.now_utc_ms();
        self.write_record(dest, sensor, state, value, now_ms)
    }

    /// Appends one event with its caller-supplied timestamp.
    pub fn write_evt(
        &self,
        dest: Destination,
        sensor: &SensorHandle,
        state: &mut SensorState,
        value: u32,
        utc_ms: u64,
    ) -> StoreResult<()> {
        if sensor.kind() != RecordKind::Evt || !state.is_active(dest) {
            return Err(StoreError::InvalidParameter);
        }
        self.write_record(dest, sensor, state, value, utc_ms)
    }

    fn write_record(
        &self,
        dest: Destination,
        sensor: &SensorHandle,
        state: &mut SensorState,
        value: u32,
        utc_ms: u64,
    ) -> StoreResult<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.draining {
            return Err(StoreError::Unavailable);
        }
        {
            let mut ctx = ChainCtx {
                pool: &mut inner.pool,
                disk: inner.disk.as_mut(),
            };
            codec::append_record(&mut ctx, dest, sensor, state, value, utc_ms)?;
        }
        spool::relieve_pressure(
            &mut inner.pool,
            &mut inner.disk,
            &inner.config,
            dest,
            sensor,
            state,
            utc_ms,
        );
        Ok(())
    }

    /// Records visible to `dest` that it has not read yet.
    pub fn count_new(
        &self,
        dest: Destination,
        _sensor: &SensorHandle,
        state: &SensorState,
    ) -> StoreResult<u32> {
        if !state.is_active(dest) {
            return Err(StoreError::InvalidParameter);
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        let ctx = ChainCtx {
            pool: &mut inner.pool,
            disk: inner.disk.as_mut(),
        };
        pending::count_new(&ctx, dest, state)
    }

    /// Reads up to `want` records into `out` without moving the commit
    /// point; the read advances the cursor and extends the pending window.
    /// Returns the filled count (0 at the frontier).
    pub fn read_bulk(
        &self,
        dest: Destination,
        sensor: &SensorHandle,
        state: &mut SensorState,
        out: &mut [Sample],
        want: usize,
    ) -> StoreResult<usize> {
        if !state.is_active(dest) {
            return Err(StoreError::InvalidParameter);
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut ctx = ChainCtx {
            pool: &mut inner.pool,
            disk: inner.disk.as_mut(),
        };
        pending::read_bulk(&mut ctx, dest, sensor, state, out, want)
    }

    /// Single-record convenience over `read_bulk`; `NoData` at the frontier.
    pub fn read_next(
        &self,
        dest: Destination,
        sensor: &SensorHandle,
        state: &mut SensorState,
    ) -> StoreResult<Sample> {
        let mut buf = [Sample { value: 0, utc_ms: 0 }];
        let filled = self.read_bulk(dest, sensor, state, &mut buf, 1)?;
        if filled == 0 {
            return Err(StoreError::NoData);
        }
        Ok(buf[0])
    }

    /// Acknowledges the first `n` records of the pending window. Sectors no
    /// destination still needs are freed (or their spool file erased).
    pub fn commit(
        &self,
        dest: Destination,
        _sensor: &SensorHandle,
        state: &mut SensorState,
        n: u32,
    ) -> StoreResult<()> {
        if !state.is_active(dest) {
            return Err(StoreError::InvalidParameter);
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut ctx = ChainCtx {
            pool: &mut inner.pool,
            disk: inner.disk.as_mut(),
        };
        pending::commit(&mut ctx, dest, state, n)
    }

    /// Drops the pending window; the next `read_bulk` repeats it verbatim.
    pub fn revert(
        &self,
        dest: Destination,
        _sensor: &SensorHandle,
        state: &mut SensorState,
    ) -> StoreResult<()> {
        if !state.is_active(dest) {
            return Err(StoreError::InvalidParameter);
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut ctx = ChainCtx {
            pool: &mut inner.pool,
            disk: inner.disk.as_mut(),
        };
        pending::revert(&mut ctx, dest, state)
    }

    pub fn stats(&self) -> StoreStats {
        let guard = self.lock();
        StoreStats {
            total_sectors: guard.pool.total(),
            free_sectors: guard.pool.free_count(),
            tsd_sectors: guard.pool.tsd_sectors(),
            evt_sectors: guard.pool.evt_sectors(),
            active_sensors: guard.active_sensors,
            efficiency_pct: guard.pool.efficiency_pct(),
            alloc_failures: guard.pool.alloc_failures,
        }
    }

    /// Full-chain validation: cycles, dangling links, wrong-owner entries,
    /// over-length chains.
    pub fn validate_chain(
        &self,
        dest: Destination,
        sensor: &SensorHandle,
        state: &SensorState,
    ) -> StoreResult<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let ctx = ChainCtx {
            pool: &mut inner.pool,
            disk: inner.disk.as_mut(),
        };
        chain::validate(&ctx, dest, sensor, state)
    }

    /// Truncates the chain at the first broken link and reclaims orphaned
    /// sectors. Returns the number of records dropped.
    pub fn repair_chain(
        &self,
        dest: Destination,
        sensor: &SensorHandle,
        state: &mut SensorState,
    ) -> StoreResult<u32> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut ctx = ChainCtx {
            pool: &mut inner.pool,
            disk: inner.disk.as_mut(),
        };
        chain::repair(&mut ctx, dest, sensor, state)
    }

    /// Rebuilds this sensor's chain from its spool directory (boot-time, once
    /// per sensor, caller-driven). Idempotent; returns the rehydrated record
    /// count. A no-op without a disk root.
    pub fn recover_sensor(
        &self,
        dest: Destination,
        sensor: &SensorHandle,
        state: &mut SensorState,
    ) -> StoreResult<u32> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(disk) = inner.disk.as_mut() else {
            return Ok(0);
        };
        spool::recovery::recover_sensor(&mut inner.pool, disk, dest, sensor, state)
    }

    /// Cooperative migration pump: relieves pool pressure using this sensor's
    /// chain. Callers round-robin their sensor arrays.
    pub fn spool_tick(
        &self,
        dest: Destination,
        sensor: &SensorHandle,
        state: &mut SensorState,
    ) -> StoreResult<()> {
        if !state.is_active(dest) {
            return Err(StoreError::InvalidParameter);
        }
        let now_ms = self.clock.now_utc_ms();
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.draining {
            return Err(StoreError::Unavailable);
        }
        spool::relieve_pressure(
            &mut inner.pool,
            &mut inner.disk,
            &inner.config,
            dest,
            sensor,
            state,
            now_ms,
        );
        Ok(())
    }

    /// Marks the store draining: writes return `Unavailable` from here on.
    pub fn power_event(&self) {
        let mut guard = self.lock();
        if !guard.draining {
            guard.draining = true;
            tracing::info!("power event received; store is draining");
        }
    }

    /// Bounded-time emergency flush of one sensor's RAM-resident chain into
    /// an emergency file. Returns the flushed record count, or `Timeout` when
    /// the deadline was exceeded (reported, not fatal).
    pub fn shutdown(
        &self,
        dest: Destination,
        sensor: &SensorHandle,
        state: &mut SensorState,
        deadline_ms: u64,
    ) -> StoreResult<u32> {
        let now_ms = self.clock.now_utc_ms();
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(disk) = inner.disk.as_mut() else {
            return Err(StoreError::Unavailable);
        };
        power::flush_sensor(
            &mut inner.pool,
            disk,
            dest,
            sensor,
            state,
            Duration::from_millis(deadline_ms),
            now_ms,
        )
    }
}
