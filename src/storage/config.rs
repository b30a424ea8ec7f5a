//! Storage configuration: artifact paths and OS resource names

use std::path::PathBuf;

use crate::{
    error::{Result, StoreError},
    monitor::DEFAULT_MONITOR_NAME,
};

/// Base SysV key; a region's 8-bit key is added to it
pub const DEFAULT_SHM_BASE_KEY: i32 = 0x5759_0000;

/// File name of the global writer lock, created under the temp directory
pub const WRITER_LOCK_FILE: &str = "osrm-datastore.lock";

pub(crate) const REQUIRED: bool = true;
pub(crate) const OPTIONAL: bool = false;

/// Artifacts contributing to the static region, in layout order
pub(crate) const STATIC_ARCHIVES: &[(bool, &str)] = &[
    (OPTIONAL, ".osrm.cells"),
    (OPTIONAL, ".osrm.partition"),
    (REQUIRED, ".osrm.icd"),
    (REQUIRED, ".osrm.properties"),
    (REQUIRED, ".osrm.nbg_nodes"),
    (REQUIRED, ".osrm.ebg_nodes"),
    (REQUIRED, ".osrm.tls"),
    (REQUIRED, ".osrm.tld"),
    (REQUIRED, ".osrm.maneuver_overrides"),
    (REQUIRED, ".osrm.edges"),
    (REQUIRED, ".osrm.names"),
    (REQUIRED, ".osrm.ramIndex"),
];

/// Artifacts contributing to the updatable region, in layout order
pub(crate) const UPDATABLE_ARCHIVES: &[(bool, &str)] = &[
    (OPTIONAL, ".osrm.mldgr"),
    (OPTIONAL, ".osrm.cell_metrics"),
    (OPTIONAL, ".osrm.hsgr"),
    (REQUIRED, ".osrm.datasource_names"),
    (REQUIRED, ".osrm.geometry"),
    (REQUIRED, ".osrm.turn_weight_penalties"),
    (REQUIRED, ".osrm.turn_duration_penalties"),
];

/// Suffix of the on-disk R-tree index whose absolute path is published
pub(crate) const FILE_INDEX_SUFFIX: &str = ".osrm.fileIndex";

/// Configuration for a [`Storage`](crate::storage::Storage) publisher
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base artifact path; suffixes are appended to its `.osrm` stem
    base: PathBuf,
    /// Name of the monitor control segment
    pub monitor_name: String,
    /// Base SysV key for data segments
    pub shm_base_key: i32,
    /// Path of the global writer lock file
    pub lock_path: PathBuf,
}

impl StorageConfig {
    /// Create a configuration from the dataset base path
    /// (e.g. `/data/berlin.osrm`)
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            monitor_name: DEFAULT_MONITOR_NAME.to_string(),
            shm_base_key: DEFAULT_SHM_BASE_KEY,
            lock_path: std::env::temp_dir().join(WRITER_LOCK_FILE),
        }
    }

    /// Use a different monitor control segment name
    pub fn with_monitor_name(mut self, name: impl Into<String>) -> Self {
        self.monitor_name = name.into();
        self
    }

    /// Use a different SysV base key for data segments
    pub fn with_shm_base_key(mut self, base_key: i32) -> Self {
        self.shm_base_key = base_key;
        self
    }

    /// Use a different writer lock path
    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = path.into();
        self
    }

    /// Resolve the path of an artifact by its suffix
    pub fn path(&self, suffix: &str) -> PathBuf {
        let base = self.base.as_os_str().to_string_lossy();
        let stem = base.strip_suffix(".osrm").unwrap_or(&base);
        PathBuf::from(format!("{}{}", stem, suffix))
    }

    /// Absolute path of the on-disk R-tree index
    pub fn file_index_path(&self) -> Result<PathBuf> {
        let path = self.path(FILE_INDEX_SUFFIX);
        std::path::absolute(&path)
            .map_err(|e| StoreError::from_io(e, "Failed to resolve file index path"))
    }

    /// Check that every required artifact exists
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();

        if !self.path(FILE_INDEX_SUFFIX).exists() {
            missing.push(self.path(FILE_INDEX_SUFFIX));
        }
        for table in [STATIC_ARCHIVES, UPDATABLE_ARCHIVES] {
            for (required, suffix) in table {
                let path = self.path(suffix);
                if *required && !path.exists() {
                    missing.push(path);
                }
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(StoreError::invalid_config(format!(
                "missing required files: {}",
                missing
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )))
        }
    }

    /// Archives for one region with their resolved paths
    pub(crate) fn region_archives(&self, table: &[(bool, &str)]) -> Vec<(bool, PathBuf)> {
        table
            .iter()
            .map(|(required, suffix)| (*required, self.path(suffix)))
            .collect()
    }
}

/// Marker for which region an archive table describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Static,
    Updatable,
}

impl RegionKind {
    /// Register entry suffix for this region
    pub fn suffix(&self) -> &'static str {
        match self {
            RegionKind::Static => "static",
            RegionKind::Updatable => "updatable",
        }
    }

    pub(crate) fn archives(&self) -> &'static [(bool, &'static str)] {
        match self {
            RegionKind::Static => STATIC_ARCHIVES,
            RegionKind::Updatable => UPDATABLE_ARCHIVES,
        }
    }
}
