//! SysV shared memory segments keyed by 8-bit region keys
//!
//! Data regions live in SysV shared memory because its lifecycle matches
//! the hand-over protocol: `IPC_RMID` only marks a segment for destruction,
//! and the kernel keeps it alive until the last attached process detaches.
//! The kernel also tracks the attach count (`shm_nattch`), which is what
//! [`SharedMemorySegment::wait_for_detach`] polls during retirement.

use std::{mem::MaybeUninit, ptr, thread, time::Duration};

use nix::errno::Errno;

use crate::error::{Result, StoreError};

/// Poll interval while waiting for readers to detach
const DETACH_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn sysv_key(base_key: i32, key: u8) -> libc::key_t {
    base_key + key as libc::key_t
}

fn segment_id(base_key: i32, key: u8) -> Result<i32> {
    let shmid = unsafe { libc::shmget(sysv_key(base_key, key), 0, 0) };
    if shmid == -1 {
        return Err(StoreError::shared_memory(format!(
            "No shared memory segment at key {}: {}",
            key,
            Errno::last()
        )));
    }
    Ok(shmid)
}

fn stat_segment(shmid: i32) -> Result<libc::shmid_ds> {
    let mut ds = MaybeUninit::<libc::shmid_ds>::uninit();
    if unsafe { libc::shmctl(shmid, libc::IPC_STAT, ds.as_mut_ptr()) } == -1 {
        return Err(StoreError::shared_memory(format!(
            "shmctl(IPC_STAT) failed: {}",
            Errno::last()
        )));
    }
    Ok(unsafe { ds.assume_init() })
}

/// An attached SysV shared memory segment
#[derive(Debug)]
pub struct SharedMemorySegment {
    key: u8,
    shmid: i32,
    size: usize,
    ptr: *mut u8,
}

impl SharedMemorySegment {
    /// Create a new segment at `key` and attach it.
    /// Fails if a segment at that key is already live.
    pub fn create(base_key: i32, key: u8, size: u64) -> Result<Self> {
        let shmid = unsafe {
            libc::shmget(
                sysv_key(base_key, key),
                size as libc::size_t,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if shmid == -1 {
            return Err(StoreError::shared_memory(format!(
                "Failed to create shared memory segment at key {} ({} bytes): {}",
                key,
                size,
                Errno::last()
            )));
        }

        Self::map(key, shmid, size as usize)
    }

    /// Attach an existing segment read/write
    pub fn attach(base_key: i32, key: u8) -> Result<Self> {
        let shmid = segment_id(base_key, key)?;
        let ds = stat_segment(shmid)?;
        Self::map(key, shmid, ds.shm_segsz as usize)
    }

    fn map(key: u8, shmid: i32, size: usize) -> Result<Self> {
        let ptr = unsafe { libc::shmat(shmid, ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(StoreError::shared_memory(format!(
                "Failed to attach shared memory segment at key {}: {}",
                key,
                Errno::last()
            )));
        }

        Ok(Self {
            key,
            shmid,
            size,
            ptr: ptr as *mut u8,
        })
    }

    /// Whether a live segment exists at `key`
    pub fn region_exists(base_key: i32, key: u8) -> bool {
        unsafe { libc::shmget(sysv_key(base_key, key), 0, 0) != -1 }
    }

    /// Mark the segment at `key` for destruction. The kernel destroys it
    /// once the last attached process detaches; this returns immediately.
    pub fn remove(base_key: i32, key: u8) -> Result<()> {
        let shmid = segment_id(base_key, key)?;
        if unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) } == -1 {
            return Err(StoreError::shared_memory(format!(
                "Failed to remove shared memory segment at key {}: {}",
                key,
                Errno::last()
            )));
        }
        Ok(())
    }

    /// Block until this process is the only one still attached
    pub fn wait_for_detach(&self) -> Result<()> {
        loop {
            let ds = stat_segment(self.shmid)?;
            if ds.shm_nattch <= 1 {
                return Ok(());
            }
            thread::sleep(DETACH_POLL_INTERVAL);
        }
    }

    /// Current attach count as reported by the kernel
    pub fn attach_count(&self) -> Result<u64> {
        Ok(stat_segment(self.shmid)?.shm_nattch as u64)
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    /// Mutable base pointer without requiring `&mut self`.
    ///
    /// # Safety
    ///
    /// Caller must guarantee exclusive write access to the region.
    pub unsafe fn as_mut_ptr_unsafe(&self) -> *mut u8 {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.ptr as *const libc::c_void);
        }
    }
}

unsafe impl Send for SharedMemorySegment {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_base_key() -> i32 {
        // Keep unit-test segments away from any real deployment keys
        0x5754_0000 + (std::process::id() as i32 & 0xFFF) * 0x100
    }

    #[test]
    fn test_create_attach_remove() {
        let base = test_base_key();
        let mut segment = SharedMemorySegment::create(base, 1, 4096).unwrap();
        assert!(SharedMemorySegment::region_exists(base, 1));
        assert_eq!(segment.size(), 4096);

        segment.as_mut_slice()[0] = 42;

        let reader = SharedMemorySegment::attach(base, 1).unwrap();
        assert_eq!(reader.as_slice()[0], 42);
        assert_eq!(segment.attach_count().unwrap(), 2);
        drop(reader);

        SharedMemorySegment::remove(base, 1).unwrap();
        segment.wait_for_detach().unwrap();
        drop(segment);
        assert!(!SharedMemorySegment::region_exists(base, 1));
    }

    #[test]
    fn test_create_existing_fails() {
        let base = test_base_key();
        let _segment = SharedMemorySegment::create(base, 2, 4096).unwrap();
        assert!(SharedMemorySegment::create(base, 2, 4096).is_err());
        SharedMemorySegment::remove(base, 2).unwrap();
    }

    #[test]
    fn test_attach_missing_fails() {
        let base = test_base_key();
        assert!(SharedMemorySegment::attach(base, 77).is_err());
    }
}
