use crate::error::{StoreError, StoreResult};
use crate::pool::SectorPool;
use crate::spool::DiskState;
use crate::types::{
    is_disk_id, Destination, RecordKind, SectorId, SensorHandle, SensorState, NULL_SECTOR,
    SECTOR_SIZE,
};
use std::collections::HashSet;

/// Unified view over the pool metadata table and the spooler's disk-backed
/// entries. Chains walk transparently across the RAM/disk boundary.
pub(crate) struct ChainCtx<'a> {
    pub pool: &'a mut SectorPool,
    pub disk: Option<&'a mut DiskState>,
}

impl ChainCtx<'_> {
    pub fn exists(&self, id: SectorId) -> bool {
        if id == NULL_SECTOR {
            return false;
        }
        if is_disk_id(id) {
            return self
                .disk
                .as_ref()
                .map(|disk| disk.entry(id).is_some())
                .unwrap_or(false);
        }
        self.pool.entry(id).map(|e| e.in_use).unwrap_or(false)
    }

    pub fn owner_of(&self, id: SectorId) -> StoreResult<(u32, Destination)> {
        if is_disk_id(id) {
            let disk = self.disk.as_ref().ok_or(StoreError::InvalidEntry)?;
            let entry = disk.entry(id).ok_or(StoreError::InvalidEntry)?;
            return Ok((entry.sensor_id, entry.owner_dest));
        }
        let entry = self.pool.entry(id).ok_or(StoreError::InvalidEntry)?;
        if !entry.in_use {
            return Err(StoreError::InvalidEntry);
        }
        Ok((entry.sensor_id, entry.owner_dest))
    }

    pub fn kind_of(&self, id: SectorId) -> StoreResult<RecordKind> {
        if is_disk_id(id) {
            let disk = self.disk.as_ref().ok_or(StoreError::InvalidEntry)?;
            return Ok(disk.entry(id).ok_or(StoreError::InvalidEntry)?.kind);
        }
        let entry = self.pool.entry(id).ok_or(StoreError::InvalidEntry)?;
        if !entry.in_use {
            return Err(StoreError::InvalidEntry);
        }
        Ok(entry.kind)
    }

    /// Records currently held by the sector.
    pub fn fill(&self, id: SectorId) -> StoreResult<u16> {
        if is_disk_id(id) {
            let disk = self.disk.as_ref().ok_or(StoreError::InvalidEntry)?;
            return Ok(disk.entry(id).ok_or(StoreError::InvalidEntry)?.records);
        }
        let entry = self.pool.entry(id).ok_or(StoreError::InvalidEntry)?;
        if !entry.in_use {
            return Err(StoreError::InvalidEntry);
        }
        Ok(entry.records)
    }

    pub fn next_of(&self, id: SectorId) -> StoreResult<SectorId> {
        if is_disk_id(id) {
            let disk = self.disk.as_ref().ok_or(StoreError::InvalidEntry)?;
            return Ok(disk.entry(id).ok_or(StoreError::InvalidEntry)?.next);
        }
        let entry = self.pool.entry(id).ok_or(StoreError::InvalidEntry)?;
        if !entry.in_use {
            return Err(StoreError::InvalidEntry);
        }
        Ok(entry.next)
    }

    pub fn set_next(&mut self, id: SectorId, next: SectorId) -> StoreResult<()> {
        if is_disk_id(id) {
            let disk = self.disk.as_mut().ok_or(StoreError::InvalidEntry)?;
            disk.entry_mut(id).ok_or(StoreError::InvalidEntry)?.next = next;
            return Ok(());
        }
        let entry = self.pool.entry_mut(id).ok_or(StoreError::InvalidEntry)?;
        if !entry.in_use {
            return Err(StoreError::InvalidEntry);
        }
        entry.next = next;
        Ok(())
    }

    pub fn pending_mask(&self, id: SectorId) -> StoreResult<u8> {
        if is_disk_id(id) {
            let disk = self.disk.as_ref().ok_or(StoreError::InvalidEntry)?;
            return Ok(disk.entry(id).ok_or(StoreError::InvalidEntry)?.pending_mask);
        }
        Ok(self
            .pool
            .entry(id)
            .ok_or(StoreError::InvalidEntry)?
            .pending_mask)
    }

    pub fn set_pending(&mut self, id: SectorId, dest: Destination) -> StoreResult<()> {
        self.update_masks(id, |pending, _| *pending |= dest.bit())
    }

    pub fn clear_pending(&mut self, id: SectorId, dest: Destination) -> StoreResult<()> {
        self.update_masks(id, |pending, _| *pending &= !dest.bit())
    }

    /// Clears the destination's ownership bit and returns the remaining mask.
    pub fn clear_dest_bit(&mut self, id: SectorId, dest: Destination) -> StoreResult<u8> {
        let mut remaining = 0;
        self.update_masks(id, |_, owned| {
            *owned &= !dest.bit();
            remaining = *owned;
        })?;
        Ok(remaining)
    }

    pub fn or_dest_mask(&mut self, id: SectorId, mask: u8) -> StoreResult<()> {
        self.update_masks(id, |_, owned| *owned |= mask)
    }

    fn update_masks(
        &mut self,
        id: SectorId,
        apply: impl FnOnce(&mut u8, &mut u8),
    ) -> StoreResult<()> {
        if is_disk_id(id) {
            let disk = self.disk.as_mut().ok_or(StoreError::InvalidEntry)?;
            let entry = disk.entry_mut(id).ok_or(StoreError::InvalidEntry)?;
            apply(&mut entry.pending_mask, &mut entry.dest_mask);
            return Ok(());
        }
        let entry = self.pool.entry_mut(id).ok_or(StoreError::InvalidEntry)?;
        if !entry.in_use {
            return Err(StoreError::InvalidEntry);
        }
        apply(&mut entry.pending_mask, &mut entry.dest_mask);
        Ok(())
    }

    /// Copies out the sector payload, reading through the spooler's file
    /// cache for disk-backed IDs.
    pub fn read_payload(&mut self, id: SectorId) -> StoreResult<[u8; SECTOR_SIZE]> {
        if is_disk_id(id) {
            let disk = self.disk.as_mut().ok_or(StoreError::InvalidEntry)?;
            return disk.read_sector(id).map_err(|err| {
                tracing::warn!(error = %err, sector = id, "failed to read spooled sector");
                StoreError::Corrupt(format!("spooled sector {id} unreadable"))
            });
        }
        let entry = self.pool.entry(id).ok_or(StoreError::InvalidEntry)?;
        if !entry.in_use {
            return Err(StoreError::InvalidEntry);
        }
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(self.pool.payload(id));
        Ok(buf)
    }

    /// Returns the sector to its backing store: pool free list for RAM IDs,
    /// spool-file bookkeeping (and possibly a journaled file erase) for
    /// disk-backed IDs.
    pub fn release(&mut self, id: SectorId) -> StoreResult<()> {
        if is_disk_id(id) {
            let disk = self.disk.as_mut().ok_or(StoreError::InvalidEntry)?;
            if let Err(err) = disk.release_entry(id) {
                // The journaled erase replays at next startup; delivery
                // semantics are unaffected.
                tracing::warn!(error = %err, sector = id, "deferred spool-file erase");
            }
            return Ok(());
        }
        if !self.pool.entry(id).map(|e| e.in_use).unwrap_or(false) {
            return Err(StoreError::InvalidEntry);
        }
        self.pool.free(id);
        Ok(())
    }

    fn max_chain_len(&self) -> usize {
        self.pool.total() as usize + self.disk.as_ref().map(|d| d.entry_count()).unwrap_or(0)
    }
}

/// Sum of unread records from `(id, rec)` to the write frontier.
pub(crate) fn records_from(
    ctx: &ChainCtx,
    state: &SensorState,
    mut id: SectorId,
    mut rec: u16,
) -> StoreResult<u32> {
    let mut count = 0u32;
    while id != NULL_SECTOR {
        let fill = ctx.fill(id)?;
        count += fill.saturating_sub(rec) as u32;
        rec = 0;
        if id == state.tail {
            break;
        }
        id = ctx.next_of(id)?;
    }
    Ok(count)
}

/// Full-chain walk with a visited set. Rejects cycles, dangling IDs,
/// wrong-owner entries and chains longer than the pool.
pub(crate) fn validate(
    ctx: &ChainCtx,
    dest: Destination,
    sensor: &SensorHandle,
    state: &SensorState,
) -> StoreResult<()> {
    if state.head == NULL_SECTOR {
        if state.tail != NULL_SECTOR {
            return Err(StoreError::Corrupt("tail set on empty chain".into()));
        }
        return Ok(());
    }
    let limit = ctx.max_chain_len();
    let mut visited: HashSet<SectorId> = HashSet::new();
    let mut id = state.head;
    let mut last = NULL_SECTOR;
    while id != NULL_SECTOR {
        if !ctx.exists(id) {
            return Err(StoreError::Corrupt(format!("dangling link to sector {id}")));
        }
        let (owner, owner_dest) = ctx.owner_of(id)?;
        if owner != sensor.id || owner_dest != dest {
            return Err(StoreError::Corrupt(format!(
                "sector {id} owned by sensor {owner}"
            )));
        }
        if !visited.insert(id) {
            return Err(StoreError::Corrupt(format!("cycle through sector {id}")));
        }
        if visited.len() > limit {
            return Err(StoreError::Corrupt("chain longer than pool".into()));
        }
        last = id;
        id = ctx.next_of(id)?;
    }
    if last != state.tail {
        return Err(StoreError::Corrupt("tail not reachable from head".into()));
    }
    Ok(())
}

/// Truncates the chain at the first broken link and reclaims every orphaned
/// sector still carrying this sensor's ownership. Returns the number of
/// records dropped.
pub(crate) fn repair(
    ctx: &mut ChainCtx,
    dest: Destination,
    sensor: &SensorHandle,
    state: &mut SensorState,
) -> StoreResult<u32> {
    let mut visited: HashSet<SectorId> = HashSet::new();
    let limit = ctx.max_chain_len();

    let good = |ctx: &ChainCtx, id: SectorId| -> bool {
        ctx.exists(id)
            && ctx
                .owner_of(id)
                .map(|(owner, od)| owner == sensor.id && od == dest)
                .unwrap_or(false)
    };

    if state.head != NULL_SECTOR && good(ctx, state.head) {
        let mut id = state.head;
        loop {
            visited.insert(id);
            let next = ctx.next_of(id)?;
            if next == NULL_SECTOR {
                if state.tail != id {
                    state.tail = id;
                    state.tail_records = ctx.fill(id)?;
                }
                break;
            }
            if !good(ctx, next) || visited.contains(&next) || visited.len() >= limit {
                ctx.set_next(id, NULL_SECTOR)?;
                state.tail = id;
                state.tail_records = ctx.fill(id)?;
                break;
            }
            id = next;
        }
    } else {
        state.head = NULL_SECTOR;
        state.tail = NULL_SECTOR;
        state.tail_records = 0;
    }

    // Orphan sweep: anything this sensor owns that the repaired chain no
    // longer reaches is unrecoverable (singly linked, no back-pointers).
    let mut dropped = 0u32;
    let mut orphans: Vec<SectorId> = Vec::new();
    for id in 0..ctx.pool.total() {
        if visited.contains(&id) {
            continue;
        }
        if let Some(entry) = ctx.pool.entry(id) {
            if entry.in_use && entry.sensor_id == sensor.id && entry.owner_dest == dest {
                orphans.push(id);
            }
        }
    }
    if let Some(disk) = ctx.disk.as_ref() {
        orphans.extend(
            disk.entry_ids()
                .into_iter()
                .filter(|id| !visited.contains(id))
                .filter(|id| {
                    disk.entry(*id)
                        .map(|e| e.sensor_id == sensor.id && e.owner_dest == dest)
                        .unwrap_or(false)
                }),
        );
    }
    for id in orphans {
        dropped += ctx.fill(id).unwrap_or(0) as u32;
        ctx.release(id)?;
    }

    // Cursors stranded off-chain restart at the write frontier.
    for slot in Destination::ALL {
        if !state.is_active(slot) {
            continue;
        }
        let cursor = state.cursor(slot);
        let stranded = (cursor.read_head != NULL_SECTOR && !visited.contains(&cursor.read_head))
            || (cursor.pending_start != NULL_SECTOR && !visited.contains(&cursor.pending_start));
        if stranded {
            let frontier = (state.tail, state.tail_records);
            let cursor = state.cursor_mut(slot);
            cursor.read_head = frontier.0;
            cursor.read_rec = frontier.1;
            cursor.pending_start = frontier.0;
            cursor.pending_start_rec = frontier.1;
            cursor.pending_count = 0;
            let mut id = state.head;
            while id != NULL_SECTOR {
                ctx.clear_pending(id, slot)?;
                if id == state.tail {
                    break;
                }
                id = ctx.next_of(id)?;
            }
        }
    }

    if dropped > 0 {
        tracing::warn!(
            sensor = sensor.id,
            dest = dest.dir_name(),
            dropped,
            "chain repaired; orphaned records dropped"
        );
    }
    Ok(dropped)
}
