pub(crate) mod file;
pub(crate) mod journal;
pub(crate) mod recovery;

use crate::chain::ChainCtx;
use crate::config::StoreConfig;
use crate::pool::SectorPool;
use crate::types::{
    is_disk_id, Destination, RecordKind, SectorId, SensorHandle, SensorState, DEST_COUNT,
    DISK_ID_BASE, NULL_SECTOR, SECTOR_SIZE,
};
use anyhow::{anyhow, Context, Result};
use journal::{Journal, JournalOp};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const OPEN_FILE_CACHE_CAP: usize = 4;
const IO_ERROR_STREAK_LIMIT: u32 = 3;
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Metadata for one sector whose payload lives in a spool file.
#[derive(Debug, Clone)]
pub(crate) struct DiskEntry {
    pub kind: RecordKind,
    pub sensor_id: u32,
    pub owner_dest: Destination,
    pub dest_mask: u8,
    pub pending_mask: u8,
    pub records: u16,
    pub next: SectorId,
    pub file: u32,
    pub index_in_file: u16,
}

#[derive(Debug)]
pub(crate) struct SpoolFile {
    pub path: PathBuf,
    pub dest: Destination,
    pub sensor_id: u32,
    pub seq: u64,
    pub live_sectors: u16,
    pub size_bytes: u64,
    pub emergency: bool,
}

#[derive(Debug)]
pub(crate) struct DestDiskState {
    pub dir: PathBuf,
    pub next_seq: u64,
    pub spooled_bytes: u64,
}

/// Per-sector spec handed to `register_file`: fill, owning-destination mask,
/// pending mask.
pub(crate) type SectorSpec = (u16, u8, u8);

/// Device-level disk subsystem: per-destination directories and sequence
/// counters, the disk-backed chain metadata, live spool-file bookkeeping, the
/// intent journal and the RAM-only degradation state.
pub(crate) struct DiskState {
    root: PathBuf,
    pub dests: [DestDiskState; DEST_COUNT],
    entries: HashMap<SectorId, DiskEntry>,
    files: HashMap<u32, SpoolFile>,
    next_disk_id: SectorId,
    next_file_key: u32,
    open_cache: HashMap<u32, fs::File>,
    pub journal: Journal,
    io_error_streak: u32,
    ram_only: bool,
    last_probe: Option<Instant>,
    keep_free_bytes: u64,
}

impl DiskState {
    pub fn open(root: &Path, keep_free_bytes: u64) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        let dests = Destination::ALL.map(|dest| {
            let dir = root.join(dest.dir_name());
            DestDiskState {
                dir,
                next_seq: 1,
                spooled_bytes: 0,
            }
        });
        for dest in &dests {
            fs::create_dir_all(&dest.dir)
                .with_context(|| format!("create {}", dest.dir.display()))?;
        }
        let (journal, scanned) = Journal::open(&root.join("journal.log"))?;
        let mut disk = Self {
            root: root.to_path_buf(),
            dests,
            entries: HashMap::new(),
            files: HashMap::new(),
            next_disk_id: DISK_ID_BASE,
            next_file_key: 1,
            open_cache: HashMap::new(),
            journal,
            io_error_streak: 0,
            ram_only: false,
            last_probe: None,
            keep_free_bytes,
        };
        recovery::replay_journal(&mut disk, scanned)?;
        Ok(disk)
    }

    pub fn dest_dir(&self, dest: Destination) -> &Path {
        &self.dests[dest.index()].dir
    }

    pub fn entry(&self, id: SectorId) -> Option<&DiskEntry> {
        self.entries.get(&id)
    }

    pub fn entry_mut(&mut self, id: SectorId) -> Option<&mut DiskEntry> {
        self.entries.get_mut(&id)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry_ids(&self) -> Vec<SectorId> {
        self.entries.keys().copied().collect()
    }

    /// Registers one spool file and its sectors. Entries are linked in file
    /// order; callers splice the run into a chain as needed.
    pub fn register_file(
        &mut self,
        path: PathBuf,
        dest: Destination,
        sensor_id: u32,
        seq: u64,
        kind: RecordKind,
        specs: &[SectorSpec],
        emergency: bool,
        size_bytes: u64,
    ) -> Vec<SectorId> {
        let key = self.next_file_key;
        self.next_file_key += 1;
        let ids: Vec<SectorId> = (0..specs.len())
            .map(|offset| {
                let id = self.next_disk_id;
                self.next_disk_id = self.next_disk_id.wrapping_add(1).max(DISK_ID_BASE);
                let (records, dest_mask, pending_mask) = specs[offset];
                self.entries.insert(
                    id,
                    DiskEntry {
                        kind,
                        sensor_id,
                        owner_dest: dest,
                        dest_mask,
                        pending_mask,
                        records,
                        next: NULL_SECTOR,
                        file: key,
                        index_in_file: offset as u16,
                    },
                );
                id
            })
            .collect();
        for pair in ids.windows(2) {
            if let Some(entry) = self.entries.get_mut(&pair[0]) {
                entry.next = pair[1];
            }
        }
        self.files.insert(
            key,
            SpoolFile {
                path,
                dest,
                sensor_id,
                seq,
                live_sectors: specs.len() as u16,
                size_bytes,
                emergency,
            },
        );
        ids
    }

    pub fn read_sector(&mut self, id: SectorId) -> Result<[u8; SECTOR_SIZE]> {
        let entry = self
            .entries
            .get(&id)
            .ok_or_else(|| anyhow!("unknown disk sector {id}"))?;
        let key = entry.file;
        let index = entry.index_in_file;
        if !self.open_cache.contains_key(&key) {
            let path = self
                .files
                .get(&key)
                .ok_or_else(|| anyhow!("unknown spool file {key}"))?
                .path
                .clone();
            if self.open_cache.len() >= OPEN_FILE_CACHE_CAP {
                self.open_cache.clear();
            }
            let handle =
                fs::File::open(&path).with_context(|| format!("open {}", path.display()))?;
            self.open_cache.insert(key, handle);
        }
        let handle = self.open_cache.get_mut(&key).expect("cached handle");
        file::read_sector_at(handle, index)
    }

    /// Drops a committed disk sector. When the owning file has no live
    /// sectors left, the file itself is erased under a journal entry.
    pub fn release_entry(&mut self, id: SectorId) -> Result<()> {
        let entry = self
            .entries
            .remove(&id)
            .ok_or_else(|| anyhow!("unknown disk sector {id}"))?;
        let empty = match self.files.get_mut(&entry.file) {
            Some(spool_file) => {
                spool_file.live_sectors = spool_file.live_sectors.saturating_sub(1);
                spool_file.live_sectors == 0
            }
            None => false,
        };
        if empty {
            self.erase_file(entry.file)?;
        }
        Ok(())
    }

    fn erase_file(&mut self, key: u32) -> Result<()> {
        let Some(spool_file) = self.files.remove(&key) else {
            return Ok(());
        };
        self.open_cache.remove(&key);
        let name = spool_file
            .path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or_default()
            .to_string();
        let op_id = self.journal.begin(
            JournalOp::Erase,
            spool_file.sensor_id,
            spool_file.dest,
            &name,
            &[],
        )?;
        match fs::remove_file(&spool_file.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("remove {name}")),
        }
        self.journal
            .commit(op_id, JournalOp::Erase, spool_file.sensor_id, spool_file.dest, &name)?;
        let dest_state = &mut self.dests[spool_file.dest.index()];
        dest_state.spooled_bytes = dest_state.spooled_bytes.saturating_sub(spool_file.size_bytes);
        tracing::debug!(
            file = %name,
            seq = spool_file.seq,
            emergency = spool_file.emergency,
            spooled_bytes = dest_state.spooled_bytes,
            "spool file fully acknowledged; erased"
        );
        Ok(())
    }

    /// Forget a sensor's rehydrated entries and file records without touching
    /// the files on disk. Used by `recover_sensor` to stay idempotent.
    pub fn forget_sensor(&mut self, dest: Destination, sensor_id: u32) {
        let keys: Vec<u32> = self
            .files
            .iter()
            .filter(|(_, f)| f.dest == dest && f.sensor_id == sensor_id)
            .map(|(key, _)| *key)
            .collect();
        for key in &keys {
            self.open_cache.remove(key);
            if let Some(spool_file) = self.files.remove(key) {
                let dest_state = &mut self.dests[spool_file.dest.index()];
                dest_state.spooled_bytes =
                    dest_state.spooled_bytes.saturating_sub(spool_file.size_bytes);
            }
        }
        self.entries
            .retain(|_, entry| !(entry.owner_dest == dest && entry.sensor_id == sensor_id));
    }

    pub fn io_ok(&mut self) {
        self.io_error_streak = 0;
    }

    pub fn io_failed(&mut self) {
        self.io_error_streak += 1;
        if self.io_error_streak >= IO_ERROR_STREAK_LIMIT && !self.ram_only {
            self.ram_only = true;
            self.last_probe = Some(Instant::now());
            tracing::warn!(
                streak = self.io_error_streak,
                "repeated spool I/O failures; entering RAM-only mode"
            );
        }
    }

    pub fn is_ram_only(&self) -> bool {
        self.ram_only
    }

    /// In RAM-only mode, a cheap create/remove probe at most every few
    /// seconds decides whether migration may resume.
    pub fn probe_health(&mut self) -> bool {
        if !self.ram_only {
            return true;
        }
        if let Some(at) = self.last_probe {
            if at.elapsed() < HEALTH_PROBE_INTERVAL {
                return false;
            }
        }
        self.last_probe = Some(Instant::now());
        let probe = self.root.join("health.probe");
        let ok = fs::write(&probe, b"ok")
            .and_then(|_| fs::remove_file(&probe))
            .is_ok();
        if ok {
            self.ram_only = false;
            self.io_error_streak = 0;
            tracing::info!("spool filesystem healthy again; leaving RAM-only mode");
        }
        ok
    }

    /// Free-space floor check. Probe failures do not block migration.
    pub fn free_space_ok(&self) -> bool {
        match statvfs_bytes(&self.root) {
            Ok((_total, free)) => free >= self.keep_free_bytes,
            Err(_) => true,
        }
    }
}

fn statvfs_bytes(path: &Path) -> Result<(u64, u64)> {
    let cpath = CString::new(path.as_os_str().to_string_lossy().as_bytes().to_vec())
        .context("invalid spool path")?;

    let mut out: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut out as *mut libc::statvfs) };
    if rc != 0 {
        return Err(anyhow!("statvfs failed"));
    }

    let block = if out.f_frsize > 0 {
        out.f_frsize as u64
    } else {
        out.f_bsize as u64
    };
    let total = (out.f_blocks as u64).saturating_mul(block);
    let free = (out.f_bavail as u64).saturating_mul(block);
    Ok((total, free))
}

pub(crate) fn chain_next(pool: &SectorPool, disk: &DiskState, id: SectorId) -> SectorId {
    if is_disk_id(id) {
        disk.entry(id).map(|e| e.next).unwrap_or(NULL_SECTOR)
    } else {
        pool.entry(id)
            .filter(|e| e.in_use)
            .map(|e| e.next)
            .unwrap_or(NULL_SECTOR)
    }
}

/// Head-forward scan for cold RAM sectors: no destination's pending window
/// covers them and the write tail is never taken.
fn collect_cold_sectors(
    pool: &SectorPool,
    disk: &DiskState,
    state: &SensorState,
    max: usize,
) -> Vec<SectorId> {
    let mut out = Vec::new();
    let mut id = state.head;
    while id != NULL_SECTOR && out.len() < max {
        if id == state.tail {
            break;
        }
        if !is_disk_id(id) {
            if let Some(entry) = pool.entry(id) {
                if entry.in_use && entry.pending_mask == 0 {
                    out.push(id);
                }
            }
        }
        id = chain_next(pool, disk, id);
    }
    out
}

/// Pressure-relief pump for one sensor. Runs on the write path and from
/// `spool_tick`; the caller's round-robin over its sensor arrays spreads the
/// relief across chains.
pub(crate) fn relieve_pressure(
    pool: &mut SectorPool,
    disk: &mut Option<DiskState>,
    config: &StoreConfig,
    dest: Destination,
    sensor: &SensorHandle,
    state: &mut SensorState,
    now_ms: u64,
) {
    let Some(disk) = disk.as_mut() else {
        return;
    };
    let total = pool.total().max(1) as f32;
    if (pool.used() as f32) / total < config.migrate_threshold {
        return;
    }
    if !disk.probe_health() {
        return;
    }
    let batch_max = match sensor.kind() {
        RecordKind::Tsd => config.tsd_migrate_batch,
        RecordKind::Evt => config.evt_migrate_batch,
    };
    loop {
        if (pool.used() as f32) / total <= config.stop_threshold {
            break;
        }
        if !disk.free_space_ok() {
            tracing::debug!("spool filesystem below free floor; keeping sectors in RAM");
            break;
        }
        let batch = collect_cold_sectors(pool, disk, state, batch_max);
        if batch.is_empty() {
            break;
        }
        match spool_sectors(pool, disk, dest, sensor, state, &batch, now_ms, false) {
            Ok(_) => disk.io_ok(),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    sensor = sensor.id,
                    "migration failed; sectors stay in RAM"
                );
                disk.io_failed();
                break;
            }
        }
    }
}

/// Moves the given RAM sectors into one spool file and rewrites the chain to
/// the new disk-backed IDs. Journal order: pending entry, atomic file write,
/// committed entry, then the in-memory splice and pool free — so a crash
/// before the commit line leaves the file an orphan and the RAM chain
/// untouched.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spool_sectors(
    pool: &mut SectorPool,
    disk: &mut DiskState,
    dest: Destination,
    sensor: &SensorHandle,
    state: &mut SensorState,
    sectors: &[SectorId],
    now_ms: u64,
    emergency: bool,
) -> Result<u32> {
    let kind = sensor.kind();
    let mut payloads: Vec<[u8; SECTOR_SIZE]> = Vec::with_capacity(sectors.len());
    let mut specs: Vec<SectorSpec> = Vec::with_capacity(sectors.len());
    let mut record_count = 0u32;
    for &id in sectors {
        let entry = pool
            .entry(id)
            .filter(|e| e.in_use)
            .ok_or_else(|| anyhow!("sector {id} not allocated"))?;
        record_count += entry.records as u32;
        specs.push((entry.records, entry.dest_mask, entry.pending_mask));
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(pool.payload(id));
        payloads.push(buf);
    }

    let seq = disk.dests[dest.index()].next_seq;
    let name = if emergency {
        file::emergency_file_name(sensor.id, seq)
    } else {
        file::data_file_name(sensor.id, seq)
    };
    let path = disk.dest_dir(dest).join(&name);
    let op = if emergency {
        JournalOp::EmergencyFlush
    } else {
        JournalOp::Migrate
    };

    let op_id = disk.journal.begin(op, sensor.id, dest, &name, sectors)?;
    let size = file::write_file(
        &path,
        file::FileHeader {
            sensor_id: sensor.id,
            dest,
            kind,
            emergency,
            seq,
            record_count,
            sector_count: 0,
            created_utc_ms: now_ms,
            checksum: 0,
        },
        &payloads,
    )?;
    if let Err(err) = disk.journal.commit(op_id, op, sensor.id, dest, &name) {
        // Without the commit line the file would be promoted on replay while
        // the records also survive in RAM; drop it and keep the RAM copy.
        fs::remove_file(&path).ok();
        return Err(err);
    }

    disk.dests[dest.index()].next_seq = seq + 1;
    disk.dests[dest.index()].spooled_bytes += size;
    let ids = disk.register_file(path, dest, sensor.id, seq, kind, &specs, emergency, size);
    let map: HashMap<SectorId, SectorId> =
        sectors.iter().copied().zip(ids.iter().copied()).collect();

    splice_chain(pool, disk, state, &map);
    for slot in Destination::ALL {
        let cursor = state.cursor_mut(slot);
        if let Some(&new_id) = map.get(&cursor.read_head) {
            cursor.read_head = new_id;
        }
        if let Some(&new_id) = map.get(&cursor.pending_start) {
            cursor.pending_start = new_id;
        }
    }
    if let Some(&new_id) = map.get(&state.tail) {
        state.tail = new_id;
    }
    for &old in sectors {
        pool.free(old);
    }
    tracing::debug!(
        sensor = sensor.id,
        dest = dest.dir_name(),
        sectors = sectors.len(),
        records = record_count,
        emergency,
        seq,
        "spooled chain sectors to disk"
    );
    Ok(record_count)
}

/// Rewrites chain links so every migrated pool ID is replaced by its
/// disk-backed ID, preserving record order exactly.
fn splice_chain(
    pool: &mut SectorPool,
    disk: &mut DiskState,
    state: &mut SensorState,
    map: &HashMap<SectorId, SectorId>,
) {
    let mut ctx = ChainCtx {
        pool,
        disk: Some(disk),
    };
    let mut prev = NULL_SECTOR;
    let mut cur = state.head;
    let mut new_head = state.head;
    while cur != NULL_SECTOR {
        let next = ctx.next_of(cur).unwrap_or(NULL_SECTOR);
        if let Some(&new_id) = map.get(&cur) {
            if prev == NULL_SECTOR {
                new_head = new_id;
            } else {
                let _ = ctx.set_next(prev, new_id);
            }
            let _ = ctx.set_next(new_id, next);
            prev = new_id;
        } else {
            prev = cur;
        }
        cur = next;
    }
    state.head = new_head;
}
