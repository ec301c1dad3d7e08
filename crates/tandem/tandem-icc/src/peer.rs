//! Liveness probe for the process on the other side of a channel.

/// Pid stored in the slot header for this process.
#[inline]
pub(crate) fn current_pid() -> u32 {
    std::process::id()
}

/// `false` only when `pid` is known to be gone.
///
/// Signal 0 performs the permission and existence checks without delivering
/// anything. `EPERM` means the process exists under another user. A zombie
/// still counts as alive until its parent reaps it.
pub(crate) fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return true;
    };
    if pid <= 0 {
        return true;
    }
    // SAFETY: kill with signal 0 has no side effects.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
