use crate::chain::{self, ChainCtx};
use crate::codec;
use crate::error::{StoreError, StoreResult};
use crate::types::{Destination, Sample, SensorHandle, SensorState, NULL_SECTOR};

/// Records between the destination's read cursor and the write frontier.
pub(crate) fn count_new(
    ctx: &ChainCtx,
    dest: Destination,
    state: &SensorState,
) -> StoreResult<u32> {
    let cursor = state.cursor(dest);
    if cursor.read_head == NULL_SECTOR {
        return Ok(0);
    }
    chain::records_from(ctx, state, cursor.read_head, cursor.read_rec)
}

/// Reads up to `want` records without advancing the commit point. The cursor
/// moves; the pending window extends from the pre-read position; each touched
/// sector gets the destination's pending bit so the spooler leaves it alone.
pub(crate) fn read_bulk(
    ctx: &mut ChainCtx,
    dest: Destination,
    sensor: &SensorHandle,
    state: &mut SensorState,
    out: &mut [Sample],
    want: usize,
) -> StoreResult<usize> {
    let want = want.min(out.len());
    let mut filled = 0usize;
    while filled < want {
        let cursor = *state.cursor(dest);
        let mut id = cursor.read_head;
        let mut rec = cursor.read_rec;
        if id == NULL_SECTOR {
            break;
        }
        // Skip past exhausted sectors up to the frontier.
        loop {
            let fill = ctx.fill(id)?;
            if rec < fill {
                break;
            }
            if id == state.tail {
                id = NULL_SECTOR;
                break;
            }
            id = ctx.next_of(id)?;
            rec = 0;
        }
        if id == NULL_SECTOR {
            break;
        }

        let kind = ctx.kind_of(id)?;
        let payload = ctx.read_payload(id)?;
        out[filled] = codec::decode_record(&payload, kind, rec, sensor.sample_period_ms)?;
        filled += 1;
        ctx.set_pending(id, dest)?;

        let cursor = state.cursor_mut(dest);
        if cursor.pending_count == 0 {
            cursor.pending_start = id;
            cursor.pending_start_rec = rec;
        }
        cursor.pending_count += 1;
        cursor.read_head = id;
        cursor.read_rec = rec + 1;
    }
    Ok(filled)
}

/// Acknowledges the first `n` records of the pending window. Sectors fully
/// committed by every destination that owns them are released; the window
/// start advances; other destinations' cursors are untouched except for
/// remapping references to a released sector.
pub(crate) fn commit(
    ctx: &mut ChainCtx,
    dest: Destination,
    state: &mut SensorState,
    n: u32,
) -> StoreResult<()> {
    let cursor = *state.cursor(dest);
    if n == 0 {
        return Ok(());
    }
    if n > cursor.pending_count {
        return Err(StoreError::InvalidParameter);
    }

    let mut id = cursor.pending_start;
    let mut rec = cursor.pending_start_rec;
    let mut remaining = n;
    while remaining > 0 {
        if id == NULL_SECTOR {
            return Err(StoreError::InvalidEntry);
        }
        let fill = ctx.fill(id)?;
        let take = (fill.saturating_sub(rec) as u32).min(remaining);
        rec += take as u16;
        remaining -= take;
        if rec < fill {
            break;
        }

        // This destination has now acknowledged the whole sector.
        let next = ctx.next_of(id)?;
        ctx.clear_pending(id, dest)?;
        let mask = ctx.clear_dest_bit(id, dest)?;
        let is_tail = id == state.tail;
        if mask == 0 {
            let repl = if is_tail { NULL_SECTOR } else { next };
            for slot in Destination::ALL {
                let other = state.cursor_mut(slot);
                if other.read_head == id {
                    other.read_head = repl;
                    other.read_rec = 0;
                }
                if other.pending_start == id {
                    other.pending_start = repl;
                    other.pending_start_rec = 0;
                }
            }
            if state.head == id {
                state.head = repl;
            }
            if is_tail {
                state.head = NULL_SECTOR;
                state.tail = NULL_SECTOR;
                state.tail_records = 0;
            }
            ctx.release(id)?;
            id = repl;
            rec = 0;
            if id == NULL_SECTOR && remaining > 0 {
                return Err(StoreError::InvalidEntry);
            }
        } else if is_tail {
            if remaining > 0 {
                return Err(StoreError::InvalidEntry);
            }
            // Stay at the frontier representation (tail, fill).
        } else {
            id = next;
            rec = 0;
        }
    }

    let cursor = state.cursor_mut(dest);
    cursor.pending_start = id;
    cursor.pending_start_rec = rec;
    cursor.pending_count -= n;
    Ok(())
}

/// Abandons the pending window: the cursor returns to the window start and a
/// later `read_bulk` re-reads the same records. Sector contents are untouched.
pub(crate) fn revert(
    ctx: &mut ChainCtx,
    dest: Destination,
    state: &mut SensorState,
) -> StoreResult<()> {
    let cursor = *state.cursor(dest);
    if cursor.pending_count == 0 {
        return Ok(());
    }
    let mut id = cursor.pending_start;
    while id != NULL_SECTOR {
        ctx.clear_pending(id, dest)?;
        if id == cursor.read_head || id == state.tail {
            break;
        }
        id = ctx.next_of(id)?;
    }
    let cursor = state.cursor_mut(dest);
    let start = (cursor.pending_start, cursor.pending_start_rec);
    cursor.read_head = start.0;
    cursor.read_rec = start.1;
    cursor.pending_count = 0;
    Ok(())
}
