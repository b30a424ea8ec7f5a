//! Dataset publisher
//!
//! [`Storage::run`] is the writer side of the hand-over protocol: it takes
//! the global writer file lock, plans one [`DataLayout`] per region from
//! the configured artifact archives, packs the artifacts into freshly
//! allocated shared memory segments, and swaps the new segments into the
//! register under the monitor mutex. Previous versions are retired only
//! after every reader has detached, so readers always observe a complete,
//! immutable dataset.

pub mod config;

pub use config::{RegionKind, StorageConfig};

use std::{fs::OpenOptions, path::PathBuf, time::Duration};

use nix::fcntl::{Flock, FlockArg};

use crate::{
    archive::{ArchiveEntry, ArchiveReader},
    error::{Result, StoreError},
    layout::{view::view_bytes_mut, Block, DataLayout},
    memory::{lock_process_memory, SharedMemorySegment},
    monitor::Monitor,
    register::{INVALID_REGION_ID, MAX_REGION_NAME_LEN},
};

/// Block holding the absolute path of the on-disk R-tree index
pub const FILE_INDEX_PATH_BLOCK: &str = "/common/rtree/file_index_path";

/// Checksum block populated from the turn data archive
pub const TURNS_CHECKSUM_BLOCK: &str = "/common/connectivity_checksum";

const CHECKSUM_BLOCK_SUFFIX: &str = "connectivity_checksum";

/// A freshly allocated, populated-but-unswapped region
struct RegionHandle {
    memory: SharedMemorySegment,
    data_offset: usize,
    shm_key: u8,
}

impl RegionHandle {
    fn data_ptr(&mut self) -> *mut u8 {
        unsafe { self.memory.as_mut_ptr().add(self.data_offset) }
    }
}

/// Connectivity checksums gathered while populating; the graph archives
/// must agree with the turn data
#[derive(Default)]
struct ChecksumTracker {
    turns: Option<u32>,
    graphs: Vec<(PathBuf, u32)>,
}

impl ChecksumTracker {
    fn record(&mut self, block_name: &str, path: &PathBuf, value: u32) {
        if block_name == TURNS_CHECKSUM_BLOCK {
            self.turns = Some(value);
        } else {
            self.graphs.push((path.clone(), value));
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(expected) = self.turns {
            for (path, actual) in &self.graphs {
                if *actual != expected {
                    return Err(StoreError::ChecksumMismatch {
                        expected,
                        actual: *actual,
                        path: path.display().to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The datastore publisher
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Publish the configured dataset under `dataset_name`.
    ///
    /// `max_wait` bounds the wait for the monitor mutex in seconds; a
    /// negative value waits forever. The global writer file lock is held
    /// for the whole operation, serializing publishers host-wide.
    pub fn run(&self, max_wait: i64, dataset_name: &str) -> Result<()> {
        self.config.validate()?;

        // Validated up front so the swap critical section cannot fail on
        // an overlong register entry name
        let longest_entry = format!("{}/{}", dataset_name, RegionKind::Updatable.suffix());
        if dataset_name.is_empty() || longest_entry.len() >= MAX_REGION_NAME_LEN {
            return Err(StoreError::invalid_config(format!(
                "dataset name must be 1..{} characters: {}",
                MAX_REGION_NAME_LEN - "/updatable".len(),
                dataset_name
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.config.lock_path)
            .map_err(|e| StoreError::from_io(e, "Failed to open datastore lock file"))?;

        let _writer_lock = match Flock::lock(lock_file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((file, nix::errno::Errno::EWOULDBLOCK)) => {
                log::warn!("Data update in progress, waiting until it finishes...");
                Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| {
                    StoreError::shared_memory(format!("Failed to lock datastore lock file: {}", e))
                })?
            }
            Err((_, e)) => {
                return Err(StoreError::shared_memory(format!(
                    "Failed to lock datastore lock file: {}",
                    e
                )))
            }
        };

        // Keep hot routing data out of swap while we hold it
        lock_process_memory();

        let monitor = Monitor::attach(&self.config.monitor_name)?;

        self.publish(&monitor, max_wait, dataset_name)
    }

    fn publish(&self, monitor: &Monitor, max_wait: i64, dataset_name: &str) -> Result<()> {
        let mut checksums = ChecksumTracker::default();
        let mut handles: Vec<(String, RegionHandle)> = Vec::new();

        for kind in [RegionKind::Static, RegionKind::Updatable] {
            let region_name = format!("{}/{}", dataset_name, kind.suffix());
            let outcome = self.build_region(monitor, kind, &mut checksums);
            match outcome {
                Ok(handle) => handles.push((region_name, handle)),
                Err(e) => {
                    self.discard_regions(monitor, handles);
                    return Err(e);
                }
            }
        }

        if let Err(e) = checksums.validate() {
            self.discard_regions(monitor, handles);
            return Err(e);
        }

        self.swap_data(monitor, handles, max_wait)
    }

    /// Plan, allocate, and populate one region
    fn build_region(
        &self,
        monitor: &Monitor,
        kind: RegionKind,
        checksums: &mut ChecksumTracker,
    ) -> Result<RegionHandle> {
        let mut layout = self.plan_layout(kind)?;
        let mut handle = self.setup_region(monitor, &mut layout)?;

        if let Err(e) = self.populate_region(&layout, &mut handle, kind, checksums) {
            let key = handle.shm_key;
            let _ = SharedMemorySegment::remove(self.config.shm_base_key, key);
            drop(handle);
            unsafe { monitor.register_unlocked() }.release_key(key);
            return Err(e);
        }

        Ok(handle)
    }

    /// Figure out how much memory a region needs and where each block
    /// lands, by enumerating the configured archives
    fn plan_layout(&self, kind: RegionKind) -> Result<DataLayout> {
        let mut layout = DataLayout::new();

        if kind == RegionKind::Static {
            let path_len = self.config.file_index_path()?.as_os_str().len() as u64;
            layout.set_block(FILE_INDEX_PATH_BLOCK, Block::new(path_len + 1, 1))?;
        }

        for (required, path) in self.config.region_archives(kind.archives()) {
            if path.exists() {
                read_blocks(&path, &mut layout)?;
            } else if required {
                return Err(StoreError::missing_required(path.display().to_string()));
            }
        }

        Ok(layout)
    }

    /// Reserve a key, recover any stale segment at it, allocate the
    /// region, and copy the serialized layout header to its start
    fn setup_region(&self, monitor: &Monitor, layout: &mut DataLayout) -> Result<RegionHandle> {
        // Safe because the writer file lock serializes all publishers
        let register = unsafe { monitor.register_unlocked() };
        let shm_key = register.reserve_key()?;

        match self.setup_region_at(shm_key, layout) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                register.release_key(shm_key);
                Err(e)
            }
        }
    }

    fn setup_region_at(&self, shm_key: u8, layout: &mut DataLayout) -> Result<RegionHandle> {
        // A segment left over from a crashed publisher may still sit at
        // this key; we only ever wait for detach on regions we retire, so
        // recovery has to happen here, before reuse.
        if SharedMemorySegment::region_exists(self.config.shm_base_key, shm_key) {
            log::warn!("Old shared memory region {} still exists.", shm_key);
            log::info!("Retrying removal...");
            while SharedMemorySegment::region_exists(self.config.shm_base_key, shm_key) {
                SharedMemorySegment::remove(self.config.shm_base_key, shm_key)?;
            }
            log::info!("ok.");
        }

        let header = layout.serialize()?;

        let region_size = header.len() as u64 + layout.data_size();
        log::info!("Data layout has a size of {} bytes", header.len());
        log::info!("Allocating shared memory of {} bytes", region_size);

        let mut memory =
            SharedMemorySegment::create(self.config.shm_base_key, shm_key, region_size)?;

        memory.as_mut_slice()[..header.len()].copy_from_slice(&header);

        Ok(RegionHandle {
            memory,
            data_offset: header.len(),
            shm_key,
        })
    }

    /// Copy every archive entry into its block
    fn populate_region(
        &self,
        layout: &DataLayout,
        handle: &mut RegionHandle,
        kind: RegionKind,
        checksums: &mut ChecksumTracker,
    ) -> Result<()> {
        let data_ptr = handle.data_ptr();

        if kind == RegionKind::Static {
            self.write_file_index_path(layout, data_ptr)?;
        }

        for (_, path) in self.config.region_archives(kind.archives()) {
            if !path.exists() {
                continue;
            }

            let mut reader = ArchiveReader::open(&path)?;
            let entries: Vec<ArchiveEntry> = reader.entries().to_vec();
            for entry in entries {
                let bytes = unsafe { view_bytes_mut(layout, data_ptr, &entry.name)? };
                reader.read_into(&entry.name, bytes)?;

                if entry.name.ends_with(CHECKSUM_BLOCK_SUFFIX) {
                    if bytes.len() < 4 {
                        return Err(StoreError::corrupt_archive(
                            path.display().to_string(),
                            format!("checksum entry {} is not 4 bytes", entry.name),
                        ));
                    }
                    let value = u32::from_le_bytes(bytes[..4].try_into().unwrap());
                    checksums.record(&entry.name, &path, value);
                }
            }
        }

        Ok(())
    }

    /// Store the NUL-terminated absolute path of the on-disk R-tree index
    fn write_file_index_path(&self, layout: &DataLayout, data_ptr: *mut u8) -> Result<()> {
        let path = self.config.file_index_path()?;
        let path_bytes = path.as_os_str().as_encoded_bytes();

        let block = unsafe { view_bytes_mut(layout, data_ptr, FILE_INDEX_PATH_BLOCK)? };
        debug_assert!(block.len() >= path_bytes.len() + 1);
        block.fill(0);
        block[..path_bytes.len()].copy_from_slice(path_bytes);

        Ok(())
    }

    /// Make the new regions visible, then retire the versions they
    /// replace. The critical section only touches the register.
    fn swap_data(
        &self,
        monitor: &Monitor,
        handles: Vec<(String, RegionHandle)>,
        max_wait: i64,
    ) -> Result<()> {
        let mut old_keys: Vec<u8> = Vec::new();

        {
            let mut guard = if max_wait >= 0 {
                match monitor.timed_lock(Duration::from_secs(max_wait as u64))? {
                    Some(guard) => guard,
                    None => {
                        log::error!(
                            "Could not acquire current region lock after {} seconds. Data update failed.",
                            max_wait
                        );
                        self.discard_regions(monitor, handles);
                        return Err(StoreError::PublishTimedOut { seconds: max_wait });
                    }
                }
            } else {
                monitor.lock()?
            };

            let register = guard.register_mut();
            for (name, handle) in &handles {
                let region_id = register.find(name);
                if region_id == INVALID_REGION_ID {
                    let region_id = register.register(name, handle.shm_key)?;
                    register.get_region_mut(region_id).timestamp += 1;
                } else {
                    let entry = register.get_region_mut(region_id);
                    old_keys.push(entry.shm_key);
                    entry.shm_key = handle.shm_key;
                    entry.timestamp += 1;
                }
            }
        }

        log::info!("All data loaded. Notify all clients about new data in:");
        for (name, handle) in &handles {
            log::info!(" {} -> {}", name, handle.shm_key);
        }
        monitor.notify_all();

        for old_key in old_keys {
            // Attach before marking for destruction; the key is
            // disassociated the moment the segment is marked
            let old_memory = SharedMemorySegment::attach(self.config.shm_base_key, old_key)?;

            log::info!("Marking old shared memory region {} for removal...", old_key);
            SharedMemorySegment::remove(self.config.shm_base_key, old_key)?;
            log::info!("ok.");

            log::info!("Waiting for clients to detach...");
            old_memory.wait_for_detach()?;
            drop(old_memory);
            log::info!(" ok.");

            unsafe { monitor.register_unlocked() }.release_key(old_key);
        }

        // New handles detach here; the segments stay alive in the register
        log::info!("All clients switched.");

        Ok(())
    }

    /// Roll back regions that were allocated but never swapped in
    fn discard_regions(&self, monitor: &Monitor, handles: Vec<(String, RegionHandle)>) {
        for (_, handle) in handles {
            let key = handle.shm_key;
            if let Err(e) = SharedMemorySegment::remove(self.config.shm_base_key, key) {
                log::warn!("Failed to remove unswapped region {}: {}", key, e);
            }
            drop(handle);
            unsafe { monitor.register_unlocked() }.release_key(key);
        }
    }
}

/// Enumerate an archive's entries into layout blocks
fn read_blocks(path: &PathBuf, layout: &mut DataLayout) -> Result<()> {
    let reader = ArchiveReader::open(path)?;

    for entry in reader.entries() {
        let element_count = entry.element_count.unwrap_or(entry.byte_size);
        let element_size = if element_count == 0 {
            1
        } else {
            if entry.byte_size % element_count != 0 {
                return Err(StoreError::corrupt_archive(
                    path.display().to_string(),
                    format!(
                        "entry {} holds {} bytes, not divisible into {} elements",
                        entry.name, entry.byte_size, element_count
                    ),
                ));
            }
            (entry.byte_size / element_count) as u32
        };

        layout.set_block(&entry.name, Block::new(element_count, element_size))?;
    }

    Ok(())
}
