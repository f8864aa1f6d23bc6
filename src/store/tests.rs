use super::*;
use crate::clock::ManualClock;
use crate::spool::file;
use crate::spool::journal::{Journal, JournalOp};
use crate::types::{is_disk_id, SectorId, SECTOR_SIZE};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PERIOD_MS: u32 = 60_000;

fn ram_store(pool_sectors: usize, clock: Arc<ManualClock>) -> SampleStore {
    SampleStore::open(
        StoreConfig {
            pool_sectors,
            ..StoreConfig::default()
        },
        clock,
    )
    .unwrap()
}

fn disk_store(pool_sectors: usize, root: &Path, clock: Arc<ManualClock>) -> SampleStore {
    SampleStore::open(
        StoreConfig {
            pool_sectors,
            disk_root: Some(root.to_path_buf()),
            keep_free_bytes: 0,
            ..StoreConfig::default()
        },
        clock,
    )
    .unwrap()
}

fn tsd_sensor(id: u32) -> (SensorHandle, SensorState) {
    (
        SensorHandle {
            id,
            sample_period_ms: PERIOD_MS,
        },
        SensorState::new(),
    )
}

/// Writes `count` TSD values starting at `base`, stepping the clock one
/// period per sample so reconstructed timestamps line up across sectors.
fn write_series(
    store: &SampleStore,
    clock: &ManualClock,
    sensor: &SensorHandle,
    state: &mut SensorState,
    base: u32,
    count: u32,
) {
    for i in 0..count {
        store
            .write_tsd(Destination::Telemetry, sensor, state, base + i)
            .unwrap();
        clock.advance(PERIOD_MS as u64);
    }
}

fn chain_ids(store: &SampleStore, state: &SensorState) -> Vec<SectorId> {
    let mut guard = store.lock();
    let inner = &mut *guard;
    let mut out = Vec::new();
    let mut id = state.head;
    while id != NULL_SECTOR {
        out.push(id);
        id = if is_disk_id(id) {
            inner
                .disk
                .as_ref()
                .and_then(|disk| disk.entry(id))
                .map(|entry| entry.next)
                .unwrap_or(NULL_SECTOR)
        } else {
            inner.pool.entry(id).map(|entry| entry.next).unwrap_or(NULL_SECTOR)
        };
    }
    out
}

fn tsd_payload(first_utc: u64, values: &[u32]) -> [u8; SECTOR_SIZE] {
    let mut buf = [0u8; SECTOR_SIZE];
    buf[..8].copy_from_slice(&first_utc.to_le_bytes());
    for (i, value) in values.iter().enumerate() {
        let at = 8 + i * 4;
        buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
    buf
}

#[test]
fn sector_conservation_through_write_commit_cycles() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = ram_store(16, clock.clone());
    let (sensor, mut state) = tsd_sensor(1);
    store
        .configure_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();

    write_series(&store, &clock, &sensor, &mut state, 100, 20);
    let stats = store.stats();
    let chained = chain_ids(&store, &state).len() as u32;
    assert_eq!(stats.free_sectors + chained, stats.total_sectors);
    assert_eq!(chained, 4); // 20 values at 6 per sector

    let mut out = vec![Sample { value: 0, utc_ms: 0 }; 20];
    let filled = store
        .read_bulk(Destination::Telemetry, &sensor, &mut state, &mut out, 20)
        .unwrap();
    assert_eq!(filled, 20);
    store
        .commit(Destination::Telemetry, &sensor, &mut state, 20)
        .unwrap();

    let stats = store.stats();
    let chained = chain_ids(&store, &state).len() as u32;
    assert_eq!(chained, 0);
    assert_eq!(stats.free_sectors, stats.total_sectors);
}

#[test]
fn exact_full_pool_rejects_only_when_tail_is_full() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = ram_store(4, clock.clone());
    let (sensor, mut state) = tsd_sensor(1);
    store
        .configure_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();

    // Three sectors fill; the fourth is the allocator's reserve.
    write_series(&store, &clock, &sensor, &mut state, 0, 17);
    assert_eq!(store.stats().free_sectors, 1);

    // Tail has one slot of capacity: the write lands without an allocation.
    store
        .write_tsd(Destination::Telemetry, &sensor, &mut state, 17)
        .unwrap();

    // Tail full, one reserve sector left: refused without mutation.
    let before = store.count_new(Destination::Telemetry, &sensor, &state).unwrap();
    let err = store
        .write_tsd(Destination::Telemetry, &sensor, &mut state, 18)
        .unwrap_err();
    assert!(matches!(err, StoreError::OutOfMemory));
    assert_eq!(
        store.count_new(Destination::Telemetry, &sensor, &state).unwrap(),
        before
    );
    assert_eq!(store.stats().free_sectors, 1);
    assert_eq!(store.stats().alloc_failures, 1);
}

#[test]
fn poked_link_is_detected_and_repaired() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = ram_store(16, clock.clone());
    let (sensor, mut state) = tsd_sensor(1);
    store
        .configure_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();

    write_series(&store, &clock, &sensor, &mut state, 100, 18);
    let ids = chain_ids(&store, &state);
    assert_eq!(ids.len(), 3);
    store
        .validate_chain(Destination::Telemetry, &sensor, &state)
        .unwrap();

    // Point the middle sector's link at a free slot.
    {
        let mut guard = store.lock();
        let inner = &mut *guard;
        let free_id = (0..inner.pool.total())
            .find(|id| !inner.pool.entry(*id).unwrap().in_use)
            .unwrap();
        inner.pool.entry_mut(ids[1]).unwrap().next = free_id;
    }

    let err = store
        .validate_chain(Destination::Telemetry, &sensor, &state)
        .unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)));

    let dropped = store
        .repair_chain(Destination::Telemetry, &sensor, &mut state)
        .unwrap();
    assert_eq!(dropped, 6); // the orphaned third sector

    store
        .validate_chain(Destination::Telemetry, &sensor, &state)
        .unwrap();
    assert_eq!(
        store.count_new(Destination::Telemetry, &sensor, &state).unwrap(),
        12
    );
    let stats = store.stats();
    assert_eq!(stats.free_sectors + 2, stats.total_sectors);
}

#[test]
fn pressure_migrates_cold_sectors_and_reads_span_the_boundary() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = disk_store(8, dir.path(), clock.clone());
    let (sensor, mut state) = tsd_sensor(3);
    store
        .configure_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();

    // Seven sectors' worth trips the 0.80 threshold mid-way; six cold head
    // sectors migrate into one file and RAM drains back under 0.70.
    write_series(&store, &clock, &sensor, &mut state, 100, 42);
    let ids = chain_ids(&store, &state);
    assert_eq!(ids.len(), 7);
    assert!(ids[..6].iter().all(|id| is_disk_id(*id)));
    assert!(!is_disk_id(ids[6]));
    assert!(store.stats().free_sectors >= 7);

    let spooled = dir.path().join("telemetry").join("sensor_3_seq_1.dat");
    assert!(spooled.exists());

    // Order and timestamps survive the RAM/disk boundary.
    assert_eq!(
        store.count_new(Destination::Telemetry, &sensor, &state).unwrap(),
        42
    );
    let mut out = vec![Sample { value: 0, utc_ms: 0 }; 42];
    let filled = store
        .read_bulk(Destination::Telemetry, &sensor, &mut state, &mut out, 42)
        .unwrap();
    assert_eq!(filled, 42);
    for (i, sample) in out.iter().enumerate() {
        assert_eq!(sample.value, 100 + i as u32);
        assert_eq!(sample.utc_ms, 1_000_000 + i as u64 * PERIOD_MS as u64);
    }

    // Full acknowledgement erases the spool file and empties the chain.
    store
        .commit(Destination::Telemetry, &sensor, &mut state, 42)
        .unwrap();
    assert!(!spooled.exists());
    assert_eq!(store.stats().free_sectors, store.stats().total_sectors);
    assert!(chain_ids(&store, &state).is_empty());
}

#[test]
fn migrated_records_survive_a_reopen() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000_000));
    {
        let store = disk_store(8, dir.path(), clock.clone());
        let (sensor, mut state) = tsd_sensor(3);
        store
            .configure_sensor(Destination::Telemetry, &sensor, &mut state)
            .unwrap();
        write_series(&store, &clock, &sensor, &mut state, 100, 42);
        // Hard stop: no shutdown, the six RAM-resident tail records die with
        // the process.
    }

    let store = disk_store(8, dir.path(), Arc::new(ManualClock::new(9_000_000)));
    let (sensor, mut state) = tsd_sensor(3);
    store
        .configure_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();
    let recovered = store
        .recover_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();
    assert_eq!(recovered, 36);

    // recover_sensor is idempotent.
    let again = store
        .recover_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();
    assert_eq!(again, 36);

    let mut out = vec![Sample { value: 0, utc_ms: 0 }; 40];
    let filled = store
        .read_bulk(Destination::Telemetry, &sensor, &mut state, &mut out, 40)
        .unwrap();
    assert_eq!(filled, 36);
    for (i, sample) in out[..36].iter().enumerate() {
        assert_eq!(sample.value, 100 + i as u32);
        assert_eq!(sample.utc_ms, 1_000_000 + i as u64 * PERIOD_MS as u64);
    }
}

#[test]
fn interrupted_migration_with_valid_file_is_promoted() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let dest_dir = root.join("telemetry");
    fs::create_dir_all(&dest_dir).unwrap();

    let name = file::data_file_name(9, 1);
    let path = dest_dir.join(&name);
    file::write_file(
        &path,
        file::FileHeader {
            sensor_id: 9,
            dest: Destination::Telemetry,
            kind: RecordKind::Tsd,
            emergency: false,
            seq: 1,
            record_count: 12,
            sector_count: 0,
            created_utc_ms: 1_000_000,
            checksum: 0,
        },
        &[
            tsd_payload(1_000_000, &[500, 501, 502, 503, 504, 505]),
            tsd_payload(1_360_000, &[506, 507, 508, 509, 510, 511]),
        ],
    )
    .unwrap();
    // Crash window: the rename landed but the commit line never did.
    {
        let (mut journal, _) = Journal::open(&root.join("journal.log")).unwrap();
        journal
            .begin(JournalOp::Migrate, 9, Destination::Telemetry, &name, &[0, 1])
            .unwrap();
    }

    let store = disk_store(16, root, Arc::new(ManualClock::new(2_000_000)));
    assert!(path.exists());
    assert_eq!(fs::metadata(root.join("journal.log")).unwrap().len(), 0);

    let (sensor, mut state) = tsd_sensor(9);
    store
        .configure_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();
    let recovered = store
        .recover_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();
    assert_eq!(recovered, 12);

    let first = store
        .read_next(Destination::Telemetry, &sensor, &mut state)
        .unwrap();
    assert_eq!(first, Sample { value: 500, utc_ms: 1_000_000 });
    let mut rest = vec![Sample { value: 0, utc_ms: 0 }; 11];
    store
        .read_bulk(Destination::Telemetry, &sensor, &mut state, &mut rest, 11)
        .unwrap();
    assert_eq!(rest[5], Sample { value: 506, utc_ms: 1_360_000 });
}

#[test]
fn interrupted_migration_with_corrupt_file_is_discarded() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let dest_dir = root.join("telemetry");
    fs::create_dir_all(&dest_dir).unwrap();

    let name = file::data_file_name(9, 1);
    let path = dest_dir.join(&name);
    file::write_file(
        &path,
        file::FileHeader {
            sensor_id: 9,
            dest: Destination::Telemetry,
            kind: RecordKind::Tsd,
            emergency: false,
            seq: 1,
            record_count: 6,
            sector_count: 0,
            created_utc_ms: 1_000_000,
            checksum: 0,
        },
        &[tsd_payload(1_000_000, &[1, 2, 3, 4, 5, 6])],
    )
    .unwrap();
    let mut raw = fs::read(&path).unwrap();
    let at = raw.len() - 5;
    raw[at] ^= 0xFF;
    fs::write(&path, raw).unwrap();

    // A half-written tmp from the same crash.
    let tmp = file::tmp_path(&dest_dir.join(file::data_file_name(9, 2)));
    fs::write(&tmp, b"partial").unwrap();

    {
        let (mut journal, _) = Journal::open(&root.join("journal.log")).unwrap();
        journal
            .begin(JournalOp::Migrate, 9, Destination::Telemetry, &name, &[0])
            .unwrap();
        journal
            .begin(
                JournalOp::Migrate,
                9,
                Destination::Telemetry,
                &file::data_file_name(9, 2),
                &[1],
            )
            .unwrap();
    }

    let store = disk_store(16, root, Arc::new(ManualClock::new(2_000_000)));
    assert!(!path.exists());
    assert!(!tmp.exists());

    let (sensor, mut state) = tsd_sensor(9);
    store
        .configure_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();
    let recovered = store
        .recover_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();
    assert_eq!(recovered, 0);
}

#[test]
fn pending_erase_replays_idempotently() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let dest_dir = root.join("gateway");
    fs::create_dir_all(&dest_dir).unwrap();

    let name = file::data_file_name(4, 7);
    let path = dest_dir.join(&name);
    file::write_file(
        &path,
        file::FileHeader {
            sensor_id: 4,
            dest: Destination::Gateway,
            kind: RecordKind::Evt,
            emergency: false,
            seq: 7,
            record_count: 2,
            sector_count: 0,
            created_utc_ms: 1_000_000,
            checksum: 0,
        },
        &[[0u8; SECTOR_SIZE]],
    )
    .unwrap();
    {
        let (mut journal, _) = Journal::open(&root.join("journal.log")).unwrap();
        journal
            .begin(JournalOp::Erase, 4, Destination::Gateway, &name, &[])
            .unwrap();
    }

    let _store = disk_store(16, root, Arc::new(ManualClock::new(1_000_000)));
    assert!(!path.exists());

    // Replaying again over the already-erased state changes nothing.
    drop(_store);
    let _store = disk_store(16, root, Arc::new(ManualClock::new(1_000_000)));
    assert!(!path.exists());
}

#[test]
fn repeated_spool_failures_enter_ram_only_mode() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = disk_store(8, dir.path(), clock.clone());
    let (sensor, mut state) = tsd_sensor(2);
    store
        .configure_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();

    // Break the spool target out from under the store.
    fs::remove_dir_all(dir.path().join("telemetry")).unwrap();

    // Writes keep succeeding against RAM while migration attempts fail.
    for i in 0..42 {
        store
            .write_tsd(Destination::Telemetry, &sensor, &mut state, i)
            .unwrap();
        clock.advance(PERIOD_MS as u64);
    }
    {
        let guard = store.lock();
        assert!(guard.disk.as_ref().unwrap().is_ram_only());
    }

    // Pool exhaustion is the only remaining limit.
    let err = loop {
        match store.write_tsd(Destination::Telemetry, &sensor, &mut state, 0) {
            Ok(()) => clock.advance(PERIOD_MS as u64),
            Err(err) => break err,
        }
    };
    assert!(matches!(err, StoreError::OutOfMemory));
    assert_eq!(
        store.count_new(Destination::Telemetry, &sensor, &state).unwrap(),
        42
    );
}

#[test]
fn deactivating_the_last_destination_releases_the_chain() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = ram_store(16, clock.clone());
    let (sensor, mut state) = tsd_sensor(1);
    store
        .configure_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();
    write_series(&store, &clock, &sensor, &mut state, 0, 12);
    assert_eq!(store.stats().active_sensors, 1);

    store
        .deactivate_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();
    assert_eq!(store.stats().active_sensors, 0);
    assert_eq!(store.stats().free_sectors, store.stats().total_sectors);
    assert!(chain_ids(&store, &state).is_empty());

    // Reactivation starts an empty stream at the frontier.
    store
        .activate_sensor(Destination::Telemetry, &sensor, &mut state)
        .unwrap();
    assert_eq!(
        store.count_new(Destination::Telemetry, &sensor, &state).unwrap(),
        0
    );
}
