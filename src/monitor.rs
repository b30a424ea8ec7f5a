//! Interprocess monitor guarding the shared region register
//!
//! One control segment at a well-known POSIX shared memory name holds, by
//! value: a magic word, a robust process-shared mutex, a process-shared
//! condition variable, and the [`SharedRegionRegister`]. Every publisher
//! and reader on the host attaches the same segment, so the mutex and
//! condvar must be embedded in it rather than referenced.
//!
//! The segment is initialized exactly once per boot by the first publisher
//! that attaches it empty; concurrent first-attach cannot happen because
//! publishers hold the global writer file lock before touching the
//! monitor. If a mutex holder dies, the next locker observes `EOWNERDEAD`,
//! marks the mutex consistent, and repairs the register's key bitmap.

use std::{mem::size_of, os::fd::AsRawFd, time::Duration};

use memmap2::{MmapMut, MmapOptions};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::{mman, stat::Mode},
    unistd::ftruncate,
};

use crate::{
    error::{Result, StoreError},
    register::SharedRegionRegister,
};

/// Default well-known name of the control segment
pub const DEFAULT_MONITOR_NAME: &str = "/waymark-regions";

/// Magic word marking an initialized control segment
pub const MONITOR_MAGIC: u64 = 0x5741594d4d4f4e31; // "WAYMMON1"

#[repr(C)]
struct ControlBlock {
    magic: u64,
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
    register: SharedRegionRegister,
}

fn control_segment_size() -> usize {
    const PAGE: usize = 4096;
    (size_of::<ControlBlock>() + PAGE - 1) & !(PAGE - 1)
}

/// Monitor over the shared region register
pub struct Monitor {
    // Keeps the mapping alive; all access goes through `block`
    _mmap: MmapMut,
    block: *mut ControlBlock,
    name: String,
}

unsafe impl Send for Monitor {}
unsafe impl Sync for Monitor {}

impl Monitor {
    /// Create-or-attach the control segment at the default name
    pub fn attach_default() -> Result<Self> {
        Self::attach(DEFAULT_MONITOR_NAME)
    }

    /// Create-or-attach a control segment.
    ///
    /// The caller must hold the global writer file lock when this may
    /// perform first-time initialization.
    pub fn attach(name: &str) -> Result<Self> {
        let fd = mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| {
            StoreError::shared_memory(format!("Failed to open control segment {}: {}", name, e))
        })?;

        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) } != 0 {
            return Err(StoreError::shared_memory(format!(
                "Failed to stat control segment {}: {}",
                name,
                Errno::last()
            )));
        }
        let stat = unsafe { stat.assume_init() };

        let size = control_segment_size();
        let fresh = stat.st_size == 0;
        if fresh {
            ftruncate(&fd, size as libc::off_t).map_err(|e| {
                StoreError::shared_memory(format!(
                    "Failed to size control segment {}: {}",
                    name, e
                ))
            })?;
        } else if (stat.st_size as usize) < size {
            return Err(StoreError::shared_memory(format!(
                "Control segment {} has incompatible size {}",
                name, stat.st_size
            )));
        }

        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&fd) }
            .map_err(|e| StoreError::from_io(e, "Failed to map control segment"))?;
        let block = mmap.as_mut_ptr() as *mut ControlBlock;

        if fresh {
            unsafe { Self::initialize(block)? };
        } else {
            let magic = unsafe { (*block).magic };
            if magic != MONITOR_MAGIC {
                return Err(StoreError::shared_memory(format!(
                    "Control segment {} is not initialized",
                    name
                )));
            }
        }

        Ok(Self {
            _mmap: mmap,
            block,
            name: name.to_string(),
        })
    }

    /// One-time in-place initialization of a zeroed control segment
    unsafe fn initialize(block: *mut ControlBlock) -> Result<()> {
        let mut mutex_attr = std::mem::MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        pthread_check(
            libc::pthread_mutexattr_init(mutex_attr.as_mut_ptr()),
            "pthread_mutexattr_init",
        )?;
        let mutex_attr = mutex_attr.as_mut_ptr();
        pthread_check(
            libc::pthread_mutexattr_setpshared(mutex_attr, libc::PTHREAD_PROCESS_SHARED),
            "pthread_mutexattr_setpshared",
        )?;
        pthread_check(
            libc::pthread_mutexattr_setrobust(mutex_attr, libc::PTHREAD_MUTEX_ROBUST),
            "pthread_mutexattr_setrobust",
        )?;
        pthread_check(
            libc::pthread_mutex_init(&mut (*block).mutex, mutex_attr),
            "pthread_mutex_init",
        )?;
        libc::pthread_mutexattr_destroy(mutex_attr);

        let mut cond_attr = std::mem::MaybeUninit::<libc::pthread_condattr_t>::uninit();
        pthread_check(
            libc::pthread_condattr_init(cond_attr.as_mut_ptr()),
            "pthread_condattr_init",
        )?;
        let cond_attr = cond_attr.as_mut_ptr();
        pthread_check(
            libc::pthread_condattr_setpshared(cond_attr, libc::PTHREAD_PROCESS_SHARED),
            "pthread_condattr_setpshared",
        )?;
        pthread_check(
            libc::pthread_cond_init(&mut (*block).cond, cond_attr),
            "pthread_cond_init",
        )?;
        libc::pthread_condattr_destroy(cond_attr);

        std::ptr::write(&mut (*block).register, SharedRegionRegister::new());
        (*block).magic = MONITOR_MAGIC;

        Ok(())
    }

    /// Name of the underlying control segment
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the monitor mutex, blocking indefinitely
    pub fn lock(&self) -> Result<MonitorGuard<'_>> {
        let rc = unsafe { libc::pthread_mutex_lock(&mut (*self.block).mutex) };
        self.finish_lock(rc).map(|_| MonitorGuard { monitor: self })
    }

    /// Acquire the monitor mutex with a deadline. Returns `None` when the
    /// deadline expires.
    pub fn timed_lock(&self, wait: Duration) -> Result<Option<MonitorGuard<'_>>> {
        let deadline = realtime_deadline(wait);
        let rc = unsafe { libc::pthread_mutex_timedlock(&mut (*self.block).mutex, &deadline) };
        if rc == libc::ETIMEDOUT {
            return Ok(None);
        }
        self.finish_lock(rc)
            .map(|_| Some(MonitorGuard { monitor: self }))
    }

    fn finish_lock(&self, rc: i32) -> Result<()> {
        match rc {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                // A publisher died while holding the mutex. Take over,
                // mark the mutex usable again, and restore the register's
                // bitmap invariant from its live entries.
                log::warn!("Recovering monitor mutex from dead holder");
                unsafe {
                    libc::pthread_mutex_consistent(&mut (*self.block).mutex);
                    (*self.block).register.repair();
                }
                Ok(())
            }
            rc => Err(StoreError::shared_memory(format!(
                "pthread_mutex_lock failed: {}",
                Errno::from_raw(rc)
            ))),
        }
    }

    /// Access the register without taking the monitor mutex.
    ///
    /// # Safety
    ///
    /// The caller must hold the global writer file lock. Key reservation
    /// and release are publisher-only operations, so serializing
    /// publishers is enough; readers never touch the key bitmap.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn register_unlocked(&self) -> &mut SharedRegionRegister {
        &mut (*self.block).register
    }

    /// Wake every process blocked in [`Monitor::wait`]
    pub fn notify_all(&self) {
        unsafe {
            libc::pthread_cond_broadcast(&mut (*self.block).cond);
        }
    }

    /// Block on the condvar until `predicate` holds. The guard is
    /// released while waiting and re-held when this returns.
    pub fn wait<F>(&self, guard: &mut MonitorGuard<'_>, mut predicate: F) -> Result<()>
    where
        F: FnMut(&SharedRegionRegister) -> bool,
    {
        debug_assert!(std::ptr::eq(guard.monitor, self));
        while !predicate(guard.register()) {
            let rc = unsafe {
                libc::pthread_cond_wait(&mut (*self.block).cond, &mut (*self.block).mutex)
            };
            if rc != 0 {
                return Err(StoreError::shared_memory(format!(
                    "pthread_cond_wait failed: {}",
                    Errno::from_raw(rc)
                )));
            }
        }
        Ok(())
    }

    /// Remove the control segment name. Existing attachments stay valid;
    /// intended for tests and administrative cleanup.
    pub fn unlink(name: &str) -> Result<()> {
        mman::shm_unlink(name).map_err(|e| {
            StoreError::shared_memory(format!("Failed to unlink control segment {}: {}", name, e))
        })
    }
}

/// Exclusive access to the register; unlocks on drop
pub struct MonitorGuard<'a> {
    monitor: &'a Monitor,
}

impl MonitorGuard<'_> {
    pub fn register(&self) -> &SharedRegionRegister {
        unsafe { &(*self.monitor.block).register }
    }

    pub fn register_mut(&mut self) -> &mut SharedRegionRegister {
        unsafe { &mut (*self.monitor.block).register }
    }
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(&mut (*self.monitor.block).mutex);
        }
    }
}

fn pthread_check(rc: i32, what: &str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(StoreError::shared_memory(format!(
            "{} failed: {}",
            what,
            Errno::from_raw(rc)
        )))
    }
}

fn realtime_deadline(wait: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }

    let mut deadline = libc::timespec {
        tv_sec: now.tv_sec + wait.as_secs() as libc::time_t,
        tv_nsec: now.tv_nsec + wait.subsec_nanos() as libc::c_long,
    };
    if deadline.tv_nsec >= 1_000_000_000 {
        deadline.tv_sec += 1;
        deadline.tv_nsec -= 1_000_000_000;
    }
    deadline
}
