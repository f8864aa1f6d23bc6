/// Opaque sector handle. Pool IDs live in `0..pool_sectors`; IDs at or above
/// `DISK_ID_BASE` reference payload that has been spooled to a disk file.
pub type SectorId = u32;

pub const NULL_SECTOR: SectorId = u32::MAX;
pub const DISK_ID_BASE: SectorId = 0x8000_0000;

/// Fixed payload size shared by every sector in the pool.
pub const SECTOR_SIZE: usize = 32;

pub(crate) const TSD_HEADER_LEN: usize = 8;
pub(crate) const TSD_VALUE_LEN: usize = 4;
pub(crate) const EVT_RECORD_LEN: usize = 12;

pub(crate) fn is_disk_id(id: SectorId) -> bool {
    id != NULL_SECTOR && id >= DISK_ID_BASE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Time-series data: one `first_utc` header plus packed values, timestamps
    /// reconstructed from the sensor period.
    Tsd,
    /// Event data: irregular `(value, utc_ms)` pairs.
    Evt,
}

impl RecordKind {
    pub fn records_per_sector(self) -> u16 {
        match self {
            RecordKind::Tsd => ((SECTOR_SIZE - TSD_HEADER_LEN) / TSD_VALUE_LEN) as u16,
            RecordKind::Evt => (SECTOR_SIZE / EVT_RECORD_LEN) as u16,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            RecordKind::Tsd => 0,
            RecordKind::Evt => 1,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RecordKind::Tsd),
            1 => Some(RecordKind::Evt),
            _ => None,
        }
    }
}

/// Upload destinations. Each destination owns an independent read cursor and
/// pending window per sensor, and doubles as the namespace for that sensor
/// collection's spool directory (gateway vs BLE vs CAN sensors may reuse
/// numeric IDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Destination {
    Telemetry = 0,
    Diagnostics = 1,
    Gateway = 2,
    Ble = 3,
    Can = 4,
}

pub const DEST_COUNT: usize = 5;

impl Destination {
    pub const ALL: [Destination; DEST_COUNT] = [
        Destination::Telemetry,
        Destination::Diagnostics,
        Destination::Gateway,
        Destination::Ble,
        Destination::Can,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Destination::Telemetry => "telemetry",
            Destination::Diagnostics => "diagnostics",
            Destination::Gateway => "gateway",
            Destination::Ble => "ble",
            Destination::Can => "can",
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        Destination::ALL.get(raw as usize).copied()
    }
}

/// Caller-owned sensor identity. `sample_period_ms == 0` selects EVT mode.
#[derive(Debug, Clone, Copy)]
pub struct SensorHandle {
    pub id: u32,
    pub sample_period_ms: u32,
}

impl SensorHandle {
    pub fn kind(&self) -> RecordKind {
        if self.sample_period_ms == 0 {
            RecordKind::Evt
        } else {
            RecordKind::Tsd
        }
    }
}

/// One decoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub value: u32,
    pub utc_ms: u64,
}

/// Per-destination read cursor and pending window.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DestCursor {
    pub read_head: SectorId,
    pub read_rec: u16,
    pub pending_start: SectorId,
    pub pending_start_rec: u16,
    pub pending_count: u32,
}

impl DestCursor {
    pub(crate) fn cleared() -> Self {
        Self {
            read_head: NULL_SECTOR,
            read_rec: 0,
            pending_start: NULL_SECTOR,
            pending_start_rec: 0,
            pending_count: 0,
        }
    }
}

/// Caller-owned per-sensor buffer state. The store writes through it but never
/// retains a reference; recovery and shutdown are invoked per sensor by the
/// caller.
#[derive(Debug, Clone)]
pub struct SensorState {
    pub(crate) head: SectorId,
    pub(crate) tail: SectorId,
    pub(crate) tail_records: u16,
    pub(crate) dest_mask: u8,
    pub(crate) cursors: [DestCursor; DEST_COUNT],
}

impl SensorState {
    pub fn new() -> Self {
        Self {
            head: NULL_SECTOR,
            tail: NULL_SECTOR,
            tail_records: 0,
            dest_mask: 0,
            cursors: [DestCursor::cleared(); DEST_COUNT],
        }
    }

    pub(crate) fn is_active(&self, dest: Destination) -> bool {
        self.dest_mask & dest.bit() != 0
    }

    pub(crate) fn cursor(&self, dest: Destination) -> &DestCursor {
        &self.cursors[dest.index()]
    }

    pub(crate) fn cursor_mut(&mut self, dest: Destination) -> &mut DestCursor {
        &mut self.cursors[dest.index()]
    }
}

impl Default for SensorState {
    fn default() -> Self {
        Self::new()
    }
}
