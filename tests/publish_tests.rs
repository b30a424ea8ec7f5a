//! End-to-end publisher tests against real shared memory
//!
//! Every test uses its own monitor name, SysV base key, and writer lock
//! file so the suite can run in parallel without cross-talk.

use std::{
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use tempfile::TempDir;
use waymark::{
    ArchiveWriter, DataLayout, Monitor, SharedMemorySegment, Storage, StorageConfig, StoreError,
    INVALID_REGION_ID, MAX_SHM_KEYS,
};

fn test_config(base: &Path, slot: i32, dir: &TempDir) -> StorageConfig {
    let pid = std::process::id() as i32;
    StorageConfig::new(base)
        .with_monitor_name(format!("/waymark-it-{}-{}", slot, pid))
        .with_shm_base_key(0x5A00_0000 | ((pid & 0x7FF) << 12) | (slot << 6))
        .with_lock_path(dir.path().join("datastore.lock"))
}

fn patterned(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// Write a complete artifact set under `dir` and return the base path
fn write_dataset(dir: &Path, turns_checksum: u32, hsgr_checksum: Option<u32>) -> PathBuf {
    let base = dir.join("map.osrm");
    let artifact = |suffix: &str| dir.join(format!("map{}", suffix));

    std::fs::write(artifact(".osrm.fileIndex"), b"rtree-leaves").unwrap();

    let typed: &[(&str, &str, u64, u32)] = &[
        (".osrm.icd", "/common/intersection_bearings", 4, 4),
        (".osrm.nbg_nodes", "/common/coordinates", 8, 8),
        (".osrm.ebg_nodes", "/common/ebg_node_data", 4, 16),
        (".osrm.tls", "/common/turn_lane_descriptions", 4, 4),
        (".osrm.tld", "/common/turn_lane_data", 2, 16),
        (".osrm.maneuver_overrides", "/common/maneuver_overrides", 2, 8),
        (".osrm.names", "/common/names", 32, 1),
        (".osrm.ramIndex", "/common/rtree", 3, 24),
        (".osrm.geometry", "/common/segment_data", 10, 4),
        (".osrm.turn_weight_penalties", "/common/turn_weight_penalty", 6, 2),
        (".osrm.turn_duration_penalties", "/common/turn_duration_penalty", 6, 2),
    ];
    for (index, (suffix, block, count, size)) in typed.iter().enumerate() {
        let mut writer = ArchiveWriter::new();
        writer.write_typed_entry(block, &patterned(index as u8, (count * *size as u64) as usize), *count);
        writer.finish(&artifact(suffix)).unwrap();
    }

    let mut writer = ArchiveWriter::new();
    writer.write_entry("/common/properties", &patterned(0x50, 32));
    writer.finish(&artifact(".osrm.properties")).unwrap();

    let mut writer = ArchiveWriter::new();
    writer.write_entry("/common/data_sources_names", &patterned(0x60, 24));
    writer.finish(&artifact(".osrm.datasource_names")).unwrap();

    let mut writer = ArchiveWriter::new();
    writer.write_typed_entry("/common/turn_data", &patterned(0x70, 72), 6);
    writer.write_entry("/common/connectivity_checksum", &turns_checksum.to_le_bytes());
    writer.finish(&artifact(".osrm.edges")).unwrap();

    if let Some(checksum) = hsgr_checksum {
        let mut writer = ArchiveWriter::new();
        writer.write_typed_entry(
            "/ch/metrics/duration/contracted_graph",
            &patterned(0x80, 40),
            5,
        );
        writer.write_entry("/ch/connectivity_checksum", &checksum.to_le_bytes());
        writer.finish(&artifact(".osrm.hsgr")).unwrap();
    }

    base
}

/// `(shm_key, timestamp)` for a register entry, or None
fn region_snapshot(config: &StorageConfig, name: &str) -> Option<(u8, u64)> {
    let monitor = Monitor::attach(&config.monitor_name).unwrap();
    let guard = monitor.lock().unwrap();
    let id = guard.register().find(name);
    if id == INVALID_REGION_ID {
        return None;
    }
    let entry = guard.register().get_region(id);
    Some((entry.shm_key, entry.timestamp))
}

fn keys_in_use(config: &StorageConfig) -> usize {
    let monitor = Monitor::attach(&config.monitor_name).unwrap();
    let guard = monitor.lock().unwrap();
    (0..MAX_SHM_KEYS as u8)
        .filter(|&k| guard.register().key_in_use(k))
        .count()
}

/// Read one block's payload out of a published region
fn read_block(config: &StorageConfig, key: u8, block: &str) -> Vec<u8> {
    let segment = SharedMemorySegment::attach(config.shm_base_key, key).unwrap();
    let layout = DataLayout::deserialize(segment.as_slice()).unwrap();
    let data_offset = layout.header_size().unwrap() as usize;
    let offset = data_offset + layout.block_offset(block).unwrap() as usize;
    let len = layout.block(block).unwrap().payload_size() as usize;
    segment.as_slice()[offset..offset + len].to_vec()
}

fn has_block(config: &StorageConfig, key: u8, block: &str) -> bool {
    let segment = SharedMemorySegment::attach(config.shm_base_key, key).unwrap();
    let layout = DataLayout::deserialize(segment.as_slice()).unwrap();
    layout.has_block(block)
}

fn cleanup(config: &StorageConfig) {
    for key in 0..8u8 {
        if SharedMemorySegment::region_exists(config.shm_base_key, key) {
            let _ = SharedMemorySegment::remove(config.shm_base_key, key);
        }
    }
    let _ = Monitor::unlink(&config.monitor_name);
}

#[test]
fn test_publish_and_republish() {
    let dir = TempDir::new().unwrap();
    let base = write_dataset(dir.path(), 0xC0FFEE, Some(0xC0FFEE));
    let config = test_config(&base, 1, &dir);

    Storage::new(config.clone()).run(-1, "alpha").unwrap();

    let (static_key, static_ts) = region_snapshot(&config, "alpha/static").unwrap();
    let (updatable_key, updatable_ts) = region_snapshot(&config, "alpha/updatable").unwrap();
    assert_eq!(static_ts, 1);
    assert_eq!(updatable_ts, 1);
    assert_ne!(static_key, updatable_key);
    assert_eq!(keys_in_use(&config), 2);

    // Payloads land byte-for-byte where the layout says
    assert_eq!(
        read_block(&config, static_key, "/common/names"),
        patterned(6, 32)
    );
    assert_eq!(
        read_block(&config, static_key, "/common/turn_data"),
        patterned(0x70, 72)
    );
    assert_eq!(
        read_block(&config, updatable_key, "/ch/metrics/duration/contracted_graph"),
        patterned(0x80, 40)
    );

    // The published file index path is the NUL-padded absolute path
    let path_block = read_block(&config, static_key, "/common/rtree/file_index_path");
    let expected = config.file_index_path().unwrap();
    let expected = expected.as_os_str().as_encoded_bytes();
    assert_eq!(&path_block[..expected.len()], expected);
    assert_eq!(path_block[expected.len()], 0);

    // Second publish: same bytes under fresh keys, versions bumped,
    // old keys reaped
    Storage::new(config.clone()).run(-1, "alpha").unwrap();

    let (new_static_key, new_static_ts) = region_snapshot(&config, "alpha/static").unwrap();
    let (new_updatable_key, new_updatable_ts) =
        region_snapshot(&config, "alpha/updatable").unwrap();
    assert_eq!(new_static_ts, 2);
    assert_eq!(new_updatable_ts, 2);
    assert_ne!(new_static_key, static_key);
    assert_ne!(new_updatable_key, updatable_key);
    assert_eq!(keys_in_use(&config), 2);
    assert!(!SharedMemorySegment::region_exists(config.shm_base_key, static_key));
    assert!(!SharedMemorySegment::region_exists(config.shm_base_key, updatable_key));

    assert_eq!(
        read_block(&config, new_static_key, "/common/names"),
        patterned(6, 32)
    );

    cleanup(&config);
}

#[test]
fn test_optional_artifacts_absent() {
    let dir = TempDir::new().unwrap();
    let base = write_dataset(dir.path(), 0xAA, None);
    let config = test_config(&base, 2, &dir);

    Storage::new(config.clone()).run(-1, "beta").unwrap();

    let (updatable_key, _) = region_snapshot(&config, "beta/updatable").unwrap();
    assert!(!has_block(
        &config,
        updatable_key,
        "/ch/metrics/duration/contracted_graph"
    ));
    assert!(has_block(&config, updatable_key, "/common/segment_data"));

    cleanup(&config);
}

#[test]
fn test_checksum_mismatch_rolls_back() {
    let dir = TempDir::new().unwrap();
    let base = write_dataset(dir.path(), 0xC0FFEE, Some(0xC0FFEE));
    let config = test_config(&base, 3, &dir);

    Storage::new(config.clone()).run(-1, "gamma").unwrap();
    let before_static = region_snapshot(&config, "gamma/static").unwrap();
    let before_updatable = region_snapshot(&config, "gamma/updatable").unwrap();

    // Regenerate the graph archive with a disagreeing checksum
    write_dataset(dir.path(), 0xC0FFEE, Some(0xDEAD));

    let err = Storage::new(config.clone()).run(-1, "gamma").unwrap_err();
    assert!(matches!(err, StoreError::ChecksumMismatch { .. }));

    // Register unchanged, no keys or segments leaked
    assert_eq!(region_snapshot(&config, "gamma/static").unwrap(), before_static);
    assert_eq!(
        region_snapshot(&config, "gamma/updatable").unwrap(),
        before_updatable
    );
    assert_eq!(keys_in_use(&config), 2);
    for key in 0..8u8 {
        let live = key == before_static.0 || key == before_updatable.0;
        assert_eq!(
            SharedMemorySegment::region_exists(config.shm_base_key, key),
            live
        );
    }

    cleanup(&config);
}

#[test]
fn test_publish_timeout_leaves_register_untouched() {
    let dir = TempDir::new().unwrap();
    let base = write_dataset(dir.path(), 0xBB, None);
    let config = test_config(&base, 4, &dir);

    Storage::new(config.clone()).run(-1, "delta").unwrap();
    let before_static = region_snapshot(&config, "delta/static").unwrap();

    // Hold the monitor mutex from another thread for the duration
    let monitor_name = config.monitor_name.clone();
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = thread::spawn(move || {
        let monitor = Monitor::attach(&monitor_name).unwrap();
        let guard = monitor.lock().unwrap();
        locked_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        drop(guard);
    });
    locked_rx.recv().unwrap();

    let start = Instant::now();
    let err = Storage::new(config.clone()).run(1, "delta").unwrap_err();
    assert!(matches!(err, StoreError::PublishTimedOut { .. }));
    assert!(start.elapsed() >= Duration::from_millis(900));

    release_tx.send(()).unwrap();
    holder.join().unwrap();

    // The holder finds the register identical to the pre-call state
    assert_eq!(region_snapshot(&config, "delta/static").unwrap(), before_static);
    assert_eq!(keys_in_use(&config), 2);
    for key in 2..8u8 {
        assert!(!SharedMemorySegment::region_exists(config.shm_base_key, key));
    }

    cleanup(&config);
}

#[test]
fn test_stale_segment_recovered_on_key_reuse() {
    let dir = TempDir::new().unwrap();
    let base = write_dataset(dir.path(), 0xCC, None);
    let config = test_config(&base, 5, &dir);

    // A crashed publisher left a segment at the key the next publish
    // will reserve first
    let stale = SharedMemorySegment::create(config.shm_base_key, 0, 4096).unwrap();
    drop(stale);
    assert!(SharedMemorySegment::region_exists(config.shm_base_key, 0));

    Storage::new(config.clone()).run(-1, "epsilon").unwrap();

    let (static_key, _) = region_snapshot(&config, "epsilon/static").unwrap();
    assert_eq!(static_key, 0);
    // The stale segment was replaced by a real region
    assert_eq!(
        read_block(&config, static_key, "/common/names"),
        patterned(6, 32)
    );

    cleanup(&config);
}

#[test]
fn test_reader_defers_retirement() {
    let dir = TempDir::new().unwrap();
    let base = write_dataset(dir.path(), 0xDD, None);
    let config = test_config(&base, 6, &dir);

    Storage::new(config.clone()).run(-1, "zeta").unwrap();
    let (old_key, _) = region_snapshot(&config, "zeta/static").unwrap();

    // A reader stays attached to the old region for a while
    let reader = SharedMemorySegment::attach(config.shm_base_key, old_key).unwrap();
    let reader_thread = thread::spawn(move || {
        // The old region stays readable even after it is marked for
        // destruction by the next publish
        thread::sleep(Duration::from_millis(1200));
        assert_eq!(&reader.as_slice()[0..8], &0x5741594d4c415931u64.to_le_bytes());
        drop(reader);
    });

    let start = Instant::now();
    Storage::new(config.clone()).run(-1, "zeta").unwrap();
    // Retirement waited for the reader to detach
    assert!(start.elapsed() >= Duration::from_millis(1000));
    reader_thread.join().unwrap();

    let (new_key, _) = region_snapshot(&config, "zeta/static").unwrap();
    assert_ne!(new_key, old_key);
    assert!(!SharedMemorySegment::region_exists(config.shm_base_key, old_key));
    assert_eq!(keys_in_use(&config), 2);

    cleanup(&config);
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    // Only the file index exists; every other required artifact is absent
    std::fs::write(dir.path().join("map.osrm.fileIndex"), b"x").unwrap();
    let config = test_config(&dir.path().join("map.osrm"), 7, &dir);

    let err = Storage::new(config.clone()).run(-1, "eta").unwrap_err();
    assert!(matches!(err, StoreError::InvalidConfig { .. }));

    cleanup(&config);
}
