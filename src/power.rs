use crate::error::{StoreError, StoreResult};
use crate::pool::SectorPool;
use crate::spool::{self, DiskState};
use crate::types::{is_disk_id, Destination, SectorId, SensorHandle, SensorState, NULL_SECTOR};
use std::time::{Duration, Instant};

/// Power-abort flush for one sensor: every RAM-resident sector of its chain,
/// partial tail included, goes into a single emergency file. The caller
/// iterates its sensor arrays and passes the per-sensor deadline; an exceeded
/// deadline is reported, not fatal — that sensor's RAM tail is lost.
pub(crate) fn flush_sensor(
    pool: &mut SectorPool,
    disk: &mut DiskState,
    dest: Destination,
    sensor: &SensorHandle,
    state: &mut SensorState,
    deadline: Duration,
    now_ms: u64,
) -> StoreResult<u32> {
    let started = Instant::now();

    let mut ram: Vec<SectorId> = Vec::new();
    let mut id = state.head;
    while id != NULL_SECTOR {
        if !is_disk_id(id) {
            ram.push(id);
        }
        id = spool::chain_next(pool, disk, id);
    }
    if ram.is_empty() {
        return Ok(0);
    }

    if started.elapsed() >= deadline {
        tracing::warn!(
            sensor = sensor.id,
            dest = dest.dir_name(),
            sectors = ram.len(),
            "emergency flush deadline exceeded before write; RAM records lost on power-off"
        );
        return Err(StoreError::Timeout);
    }

    match spool::spool_sectors(pool, disk, dest, sensor, state, &ram, now_ms, true) {
        Ok(records) => {
            tracing::info!(
                sensor = sensor.id,
                dest = dest.dir_name(),
                records,
                "emergency flush complete"
            );
            Ok(records)
        }
        Err(err) => {
            tracing::warn!(
                error = %err,
                sensor = sensor.id,
                "emergency flush failed"
            );
            disk.io_failed();
            Err(StoreError::Init(err.to_string()))
        }
    }
}
