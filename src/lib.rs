//! # Waymark - Shared-Memory Dataset Publisher
//!
//! Waymark loads the on-disk artifacts describing a road network, packs
//! them into tightly laid-out shared memory regions, and atomically swaps
//! each region into place under a named dataset so that concurrent reader
//! processes always observe a consistent version. Old regions are marked
//! for destruction but stay alive until the last reader detaches.
//!
//! ## Features
//!
//! - **Self-describing regions**: each region starts with a serialized
//!   layout header that lets any process reconstruct block offsets
//! - **Atomic hand-over**: versions swap under an interprocess monitor;
//!   readers never see a partially published dataset
//! - **Deferred retirement**: old segments are reaped only after every
//!   reader has detached
//! - **Single global writer**: a file lock serializes publishers host-wide
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                 Publisher (Storage)               │
//! ├───────────────────────────────────────────────────┤
//! │  Archives → DataLayout → SysV data segments       │
//! │                              │  swap under        │
//! │  Control segment:            ▼                    │
//! │  monitor mutex + condvar + region register        │
//! └───────────────────────────────────────────────────┘
//!               │                        │
//!               ▼                        ▼
//!    ┌──────────────────┐    ┌─────────────────────┐
//!    │  Reader process  │    │  Reader process     │
//!    │  (attached, old) │    │  (attached, new)    │
//!    └──────────────────┘    └─────────────────────┘
//! ```

// Core modules
pub mod archive;
pub mod cache;
pub mod error;
pub mod layout;
pub mod memory;
pub mod monitor;
pub mod register;
pub mod storage;

// Main API re-exports
pub use archive::{ArchiveEntry, ArchiveReader, ArchiveWriter};
pub use cache::{EdgeKey, PathAnnotation, UnpackingCache};
pub use error::{Result, StoreError};
pub use layout::{Block, DataLayout};
pub use memory::SharedMemorySegment;
pub use monitor::{Monitor, MonitorGuard};
pub use register::{SharedRegionRegister, INVALID_REGION_ID, MAX_SHM_KEYS};
pub use storage::{RegionKind, Storage, StorageConfig};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
