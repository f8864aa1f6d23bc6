use super::file;
use super::journal::{JournalEntry, JournalOp, JournalState};
use super::{chain_next, DiskState};
use crate::error::{StoreError, StoreResult};
use crate::pool::SectorPool;
use crate::types::{
    is_disk_id, DestCursor, Destination, SectorId, SensorHandle, SensorState, NULL_SECTOR,
    SECTOR_SIZE,
};
use anyhow::Result;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

/// Startup journal replay. Committed entries already took effect; a pending
/// migrate/flush is promoted when its target file exists and checksums, and
/// cleaned up otherwise; a pending erase re-runs idempotently. The journal is
/// truncated afterwards.
pub(crate) fn replay_journal(disk: &mut DiskState, scanned: Vec<JournalEntry>) -> Result<()> {
    let committed: HashSet<u64> = scanned
        .iter()
        .filter(|e| e.state == JournalState::Committed)
        .map(|e| e.op_id)
        .collect();

    for entry in scanned
        .iter()
        .filter(|e| e.state == JournalState::Pending && !committed.contains(&e.op_id))
    {
        let Some(dest) = Destination::from_u8(entry.destination) else {
            tracing::warn!(op_id = entry.op_id, "journal entry with unknown destination");
            continue;
        };
        let path = disk.dest_dir(dest).join(&entry.file_name);
        match entry.op {
            JournalOp::Migrate | JournalOp::EmergencyFlush => {
                let valid = path.exists() && file::verify_file(&path).is_ok();
                if valid {
                    tracing::info!(file = %entry.file_name, "promoting interrupted spool write");
                } else {
                    if path.exists() {
                        fs::remove_file(&path).ok();
                        tracing::warn!(file = %entry.file_name, "removed orphan spool file");
                    }
                    fs::remove_file(file::tmp_path(&path)).ok();
                }
            }
            JournalOp::Erase => {
                if path.exists() {
                    fs::remove_file(&path).ok();
                    tracing::info!(file = %entry.file_name, "replayed pending erase");
                }
            }
        }
    }

    // Best-effort: sweep stray tmp files and seed per-destination sequence
    // counters past anything already on disk.
    for dest in Destination::ALL {
        let dir = disk.dest_dir(dest).to_path_buf();
        let mut max_seq = 0u64;
        if let Ok(listing) = fs::read_dir(&dir) {
            for entry in listing.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
                    continue;
                };
                if name.ends_with(".tmp") {
                    fs::remove_file(&path).ok();
                    continue;
                }
                if let Some((_, seq, _)) = file::parse_file_name(name) {
                    max_seq = max_seq.max(seq);
                }
            }
        }
        let dest_state = &mut disk.dests[dest.index()];
        dest_state.next_seq = dest_state.next_seq.max(max_seq + 1);
    }

    disk.journal.reset()?;
    Ok(())
}

/// Rebuilds one sensor's chain from its spool directory, oldest sequence
/// first. Idempotent: any prior rehydration for the (destination, sensor)
/// pair is forgotten before the scan, so running it twice yields the same
/// counts. Corrupt files are logged and skipped.
pub(crate) fn recover_sensor(
    pool: &mut SectorPool,
    disk: &mut DiskState,
    dest: Destination,
    sensor: &SensorHandle,
    state: &mut SensorState,
) -> StoreResult<u32> {
    // Whatever the state references now is superseded by the on-disk truth.
    let mut ram: Vec<SectorId> = Vec::new();
    let mut id = state.head;
    while id != NULL_SECTOR {
        let next = chain_next(pool, disk, id);
        if !is_disk_id(id) {
            ram.push(id);
        }
        id = next;
    }
    for id in ram {
        pool.free(id);
    }
    disk.forget_sensor(dest, sensor.id);
    state.head = NULL_SECTOR;
    state.tail = NULL_SECTOR;
    state.tail_records = 0;
    for slot in Destination::ALL {
        *state.cursor_mut(slot) = DestCursor::cleared();
    }

    let dir = disk.dest_dir(dest).to_path_buf();
    let mut found: Vec<(u64, PathBuf)> = Vec::new();
    let listing = fs::read_dir(&dir).map_err(|err| StoreError::Init(err.to_string()))?;
    for entry in listing {
        let entry = entry.map_err(|err| StoreError::Init(err.to_string()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        let Some((sensor_id, seq, _)) = file::parse_file_name(name) else {
            continue;
        };
        if sensor_id != sensor.id {
            continue;
        }
        found.push((seq, path));
    }
    found.sort_by_key(|(seq, _)| *seq);

    let mut total_records = 0u32;
    let mut prev_tail = NULL_SECTOR;
    for (seq, path) in found {
        let (header, payloads) = match file::read_file(&path) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(error = %err, file = %path.display(), "skipping unreadable spool file");
                continue;
            }
        };
        let per = header.kind.records_per_sector() as u32;
        let sector_count = payloads.len() as u32;
        if sector_count == 0 {
            continue;
        }
        if header.sensor_id != sensor.id
            || header.record_count <= (sector_count - 1) * per
            || header.record_count > sector_count * per
        {
            tracing::warn!(file = %path.display(), "spool file header inconsistent; skipping");
            continue;
        }
        let size = (file::FILE_HEADER_LEN + payloads.len() * SECTOR_SIZE) as u64;
        let mut specs = Vec::with_capacity(sector_count as usize);
        for index in 0..sector_count {
            let fill = if index + 1 == sector_count {
                header.record_count - (sector_count - 1) * per
            } else {
                per
            };
            specs.push((fill as u16, state.dest_mask, 0u8));
        }
        let ids = disk.register_file(
            path,
            dest,
            sensor.id,
            seq,
            header.kind,
            &specs,
            header.emergency,
            size,
        );
        let dest_state = &mut disk.dests[dest.index()];
        dest_state.spooled_bytes += size;
        dest_state.next_seq = dest_state.next_seq.max(seq + 1);

        if state.head == NULL_SECTOR {
            state.head = ids[0];
        }
        if prev_tail != NULL_SECTOR {
            if let Some(entry) = disk.entry_mut(prev_tail) {
                entry.next = ids[0];
            }
        }
        prev_tail = *ids.last().expect("non-empty file run");
        state.tail = prev_tail;
        state.tail_records = specs.last().expect("non-empty file run").0;
        total_records += header.record_count;
    }

    let head = state.head;
    for slot in Destination::ALL {
        if state.is_active(slot) {
            let cursor = state.cursor_mut(slot);
            cursor.read_head = head;
            cursor.read_rec = 0;
            cursor.pending_start = head;
            cursor.pending_start_rec = 0;
            cursor.pending_count = 0;
        }
    }

    if total_records > 0 {
        tracing::info!(
            sensor = sensor.id,
            dest = dest.dir_name(),
            records = total_records,
            "rehydrated sensor chain from spool files"
        );
    }
    Ok(total_records)
}
