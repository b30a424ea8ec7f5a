//! OS-level shared memory segments and process memory locking

pub mod segment;

pub use segment::SharedMemorySegment;

/// Best-effort `mlockall` so hot routing data is never paged out.
/// Failure is logged and swallowed; publishing proceeds either way.
#[cfg(target_os = "linux")]
pub fn lock_process_memory() {
    let flags = libc::MCL_CURRENT | libc::MCL_FUTURE;
    if unsafe { libc::mlockall(flags) } != 0 {
        log::warn!("Could not request RAM lock: {}", nix::errno::Errno::last());
    }
}

#[cfg(not(target_os = "linux"))]
pub fn lock_process_memory() {}
