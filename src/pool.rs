use crate::types::{
    Destination, RecordKind, SectorId, EVT_RECORD_LEN, NULL_SECTOR, SECTOR_SIZE, TSD_VALUE_LEN,
};

/// The allocator keeps one sector in reserve so a full pool is reported
/// before the very last slot is consumed.
const ALLOC_RESERVE: u32 = 1;

/// Chain metadata, held in a parallel table rather than inside the sectors.
/// Keeping the link out of the payload is what buys the 75% value density.
#[derive(Debug, Clone)]
pub(crate) struct ChainEntry {
    pub in_use: bool,
    pub kind: RecordKind,
    pub sensor_id: u32,
    /// Namespace the owning sensor was written through. Sensor IDs are only
    /// unique per destination (gateway vs BLE vs CAN collections may collide).
    pub owner_dest: Destination,
    /// Destinations that still need this sector.
    pub dest_mask: u8,
    /// Destinations whose pending window currently covers this sector.
    pub pending_mask: u8,
    /// Records written into the sector so far (fill).
    pub records: u16,
    pub next: SectorId,
}

impl ChainEntry {
    fn vacant(next_free: SectorId) -> Self {
        Self {
            in_use: false,
            kind: RecordKind::Tsd,
            sensor_id: 0,
            owner_dest: Destination::Telemetry,
            dest_mask: 0,
            pending_mask: 0,
            records: 0,
            next: next_free,
        }
    }
}

/// Fixed-count sector pool: one payload arena plus the parallel metadata
/// table. The free list is threaded through the `next` field of vacant
/// entries.
pub(crate) struct SectorPool {
    payload: Vec<u8>,
    meta: Vec<ChainEntry>,
    free_head: SectorId,
    free_count: u32,
    tsd_sectors: u32,
    evt_sectors: u32,
    live_tsd_records: u64,
    live_evt_records: u64,
    pub alloc_failures: u64,
}

impl SectorPool {
    pub fn new(sectors: usize) -> Self {
        let mut meta = Vec::with_capacity(sectors);
        for idx in 0..sectors {
            let next = if idx + 1 < sectors {
                (idx + 1) as SectorId
            } else {
                NULL_SECTOR
            };
            meta.push(ChainEntry::vacant(next));
        }
        Self {
            payload: vec![0u8; sectors * SECTOR_SIZE],
            meta,
            free_head: if sectors > 0 { 0 } else { NULL_SECTOR },
            free_count: sectors as u32,
            tsd_sectors: 0,
            evt_sectors: 0,
            live_tsd_records: 0,
            live_evt_records: 0,
            alloc_failures: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.meta.len() as u32
    }

    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    pub fn used(&self) -> u32 {
        self.total() - self.free_count
    }

    pub fn tsd_sectors(&self) -> u32 {
        self.tsd_sectors
    }

    pub fn evt_sectors(&self) -> u32 {
        self.evt_sectors
    }

    pub fn alloc(
        &mut self,
        sensor_id: u32,
        owner_dest: Destination,
        kind: RecordKind,
        dest_mask: u8,
    ) -> Option<SectorId> {
        if self.free_count <= ALLOC_RESERVE || self.free_head == NULL_SECTOR {
            self.alloc_failures += 1;
            return None;
        }
        let id = self.free_head;
        self.free_head = self.meta[id as usize].next;
        self.free_count -= 1;
        self.meta[id as usize] = ChainEntry {
            in_use: true,
            kind,
            sensor_id,
            owner_dest,
            dest_mask,
            pending_mask: 0,
            records: 0,
            next: NULL_SECTOR,
        };
        self.payload[id as usize * SECTOR_SIZE..(id as usize + 1) * SECTOR_SIZE].fill(0);
        match kind {
            RecordKind::Tsd => self.tsd_sectors += 1,
            RecordKind::Evt => self.evt_sectors += 1,
        }
        Some(id)
    }

    pub fn free(&mut self, id: SectorId) {
        let entry = &self.meta[id as usize];
        debug_assert!(entry.in_use, "freeing vacant sector {id}");
        match entry.kind {
            RecordKind::Tsd => {
                self.tsd_sectors = self.tsd_sectors.saturating_sub(1);
                self.live_tsd_records = self.live_tsd_records.saturating_sub(entry.records as u64);
            }
            RecordKind::Evt => {
                self.evt_sectors = self.evt_sectors.saturating_sub(1);
                self.live_evt_records = self.live_evt_records.saturating_sub(entry.records as u64);
            }
        }
        self.meta[id as usize] = ChainEntry::vacant(self.free_head);
        self.free_head = id;
        self.free_count += 1;
    }

    /// Bump the fill of `id` by one record, keeping the live-record counters
    /// that feed the efficiency statistic in sync.
    pub fn record_written(&mut self, id: SectorId) {
        let kind = self.meta[id as usize].kind;
        self.meta[id as usize].records += 1;
        match kind {
            RecordKind::Tsd => self.live_tsd_records += 1,
            RecordKind::Evt => self.live_evt_records += 1,
        }
    }

    pub fn entry(&self, id: SectorId) -> Option<&ChainEntry> {
        self.meta.get(id as usize)
    }

    pub fn entry_mut(&mut self, id: SectorId) -> Option<&mut ChainEntry> {
        self.meta.get_mut(id as usize)
    }

    pub fn payload(&self, id: SectorId) -> &[u8] {
        &self.payload[id as usize * SECTOR_SIZE..(id as usize + 1) * SECTOR_SIZE]
    }

    pub fn payload_mut(&mut self, id: SectorId) -> &mut [u8] {
        &mut self.payload[id as usize * SECTOR_SIZE..(id as usize + 1) * SECTOR_SIZE]
    }

    /// Ratio of value bytes to allocated sector bytes, in percent. An empty
    /// pool wastes nothing and reports 100.
    pub fn efficiency_pct(&self) -> u32 {
        let used_bytes = self.used() as u64 * SECTOR_SIZE as u64;
        if used_bytes == 0 {
            return 100;
        }
        let value_bytes = self.live_tsd_records * TSD_VALUE_LEN as u64
            + self.live_evt_records * EVT_RECORD_LEN as u64;
        (value_bytes * 100 / used_bytes) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip_restores_free_count() {
        let mut pool = SectorPool::new(8);
        assert_eq!(pool.free_count(), 8);
        let a = pool
            .alloc(1, Destination::Telemetry, RecordKind::Tsd, 0b1)
            .unwrap();
        let b = pool
            .alloc(1, Destination::Telemetry, RecordKind::Evt, 0b1)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.used(), 2);
        pool.free(a);
        pool.free(b);
        assert_eq!(pool.free_count(), 8);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn last_sector_is_held_in_reserve() {
        let mut pool = SectorPool::new(3);
        assert!(pool.alloc(1, Destination::Telemetry, RecordKind::Tsd, 0b1).is_some());
        assert!(pool.alloc(1, Destination::Telemetry, RecordKind::Tsd, 0b1).is_some());
        assert!(pool.alloc(1, Destination::Telemetry, RecordKind::Tsd, 0b1).is_none());
        assert_eq!(pool.alloc_failures, 1);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn efficiency_tracks_record_fill() {
        let mut pool = SectorPool::new(4);
        assert_eq!(pool.efficiency_pct(), 100);
        let id = pool.alloc(7, Destination::Telemetry, RecordKind::Tsd, 0b1).unwrap();
        assert_eq!(pool.efficiency_pct(), 0);
        for _ in 0..6 {
            pool.record_written(id);
        }
        // Full TSD sector: 24 value bytes of 32.
        assert_eq!(pool.efficiency_pct(), 75);
    }

    #[test]
    fn freed_sector_is_reused() {
        let mut pool = SectorPool::new(4);
        let a = pool.alloc(1, Destination::Telemetry, RecordKind::Tsd, 0b1).unwrap();
        pool.free(a);
        let b = pool.alloc(2, Destination::Ble, RecordKind::Evt, 0b10).unwrap();
        assert_eq!(a, b);
        let entry = pool.entry(b).unwrap();
        assert_eq!(entry.sensor_id, 2);
        assert_eq!(entry.owner_dest, Destination::Ble);
        assert_eq!(entry.kind, RecordKind::Evt);
        assert_eq!(entry.records, 0);
    }
}
