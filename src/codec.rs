use crate::chain::ChainCtx;
use crate::error::{StoreError, StoreResult};
use crate::types::{
    is_disk_id, Destination, RecordKind, Sample, SensorHandle, SensorState, EVT_RECORD_LEN,
    NULL_SECTOR, TSD_HEADER_LEN, TSD_VALUE_LEN,
};

/// Stamp a fresh TSD sector: the 8-byte `first_sample_utc_ms` header that
/// every packed value's timestamp derives from.
fn init_tsd_sector(payload: &mut [u8], first_utc_ms: u64) {
    payload[..TSD_HEADER_LEN].copy_from_slice(&first_utc_ms.to_le_bytes());
}

fn put_tsd_value(payload: &mut [u8], index: u16, value: u32) {
    let at = TSD_HEADER_LEN + index as usize * TSD_VALUE_LEN;
    payload[at..at + TSD_VALUE_LEN].copy_from_slice(&value.to_le_bytes());
}

fn put_evt_record(payload: &mut [u8], index: u16, value: u32, utc_ms: u64) {
    let at = index as usize * EVT_RECORD_LEN;
    payload[at..at + 4].copy_from_slice(&value.to_le_bytes());
    payload[at + 4..at + 12].copy_from_slice(&utc_ms.to_le_bytes());
}

/// Decode record `index` from a sector payload. TSD timestamps are
/// reconstructed from the sector header and the sensor period; EVT records
/// carry their own.
pub(crate) fn decode_record(
    payload: &[u8],
    kind: RecordKind,
    index: u16,
    sample_period_ms: u32,
) -> StoreResult<Sample> {
    if index >= kind.records_per_sector() {
        return Err(StoreError::Corrupt(format!(
            "record index {index} outside sector layout"
        )));
    }
    match kind {
        RecordKind::Tsd => {
            let first_utc = u64::from_le_bytes(payload[..TSD_HEADER_LEN].try_into().unwrap());
            let at = TSD_HEADER_LEN + index as usize * TSD_VALUE_LEN;
            let value = u32::from_le_bytes(payload[at..at + TSD_VALUE_LEN].try_into().unwrap());
            Ok(Sample {
                value,
                utc_ms: first_utc + index as u64 * sample_period_ms as u64,
            })
        }
        RecordKind::Evt => {
            let at = index as usize * EVT_RECORD_LEN;
            let value = u32::from_le_bytes(payload[at..at + 4].try_into().unwrap());
            let utc_ms = u64::from_le_bytes(payload[at + 4..at + 12].try_into().unwrap());
            Ok(Sample { value, utc_ms })
        }
    }
}

/// Append one record at the write frontier, allocating and linking a new tail
/// sector when the current one is full (or disk-backed, or absent). Returns
/// without mutating anything if the pool cannot supply a sector.
pub(crate) fn append_record(
    ctx: &mut ChainCtx,
    dest: Destination,
    sensor: &SensorHandle,
    state: &mut SensorState,
    value: u32,
    utc_ms: u64,
) -> StoreResult<()> {
    let kind = sensor.kind();
    let per_sector = kind.records_per_sector();

    let tail_full = state.tail == NULL_SECTOR
        || is_disk_id(state.tail)
        || ctx.fill(state.tail)? == per_sector;

    if tail_full {
        let id = ctx
            .pool
            .alloc(sensor.id, dest, kind, state.dest_mask)
            .ok_or(StoreError::OutOfMemory)?;
        if kind == RecordKind::Tsd {
            init_tsd_sector(ctx.pool.payload_mut(id), utc_ms);
        }
        if state.tail == NULL_SECTOR {
            state.head = id;
            // First sector of a fresh chain: point idle cursors at it.
            for slot in Destination::ALL {
                if !state.is_active(slot) {
                    continue;
                }
                let cursor = state.cursor_mut(slot);
                if cursor.read_head == NULL_SECTOR {
                    cursor.read_head = id;
                    cursor.read_rec = 0;
                    cursor.pending_start = id;
                    cursor.pending_start_rec = 0;
                }
            }
        } else {
            ctx.set_next(state.tail, id)?;
        }
        state.tail = id;
        state.tail_records = 0;
    }

    let tail = state.tail;
    let index = ctx.fill(tail)?;
    match kind {
        RecordKind::Tsd => put_tsd_value(ctx.pool.payload_mut(tail), index, value),
        RecordKind::Evt => put_evt_record(ctx.pool.payload_mut(tail), index, value, utc_ms),
    }
    ctx.pool.record_written(tail);
    // Late-configured destinations join the broadcast from the record on.
    ctx.or_dest_mask(tail, state.dest_mask)?;
    state.tail_records += 1;
    Ok(())
}
