use tracing::{debug, warn};

/// Send SIGKILL to the process group led by `pgid`.
///
/// Children are spawned as group leaders, so this also reaches anything they
/// started (pip build backends, compilers).
#[allow(unsafe_code)]
pub(crate) fn kill_process_group(pgid: u32) {
    let Ok(pgid) = i32::try_from(pgid) else {
        warn!("refusing to signal out-of-range pgid {pgid}");
        return;
    };
    if pgid <= 1 {
        return;
    }
    debug!("sending SIGKILL to process group {pgid}");
    // SAFETY: kill() takes plain integers and has no memory effects; pgid > 1
    // was validated above, the negation addresses the group, never all processes.
    let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if ret != 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            warn!("failed to kill process group {pgid}: {errno}");
        }
    }
}
