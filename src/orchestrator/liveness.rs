//! Process liveness checks.
//!
//! Liveness is a process-table existence query and nothing more. A pid
//! recycled by an unrelated process after the session server exited
//! reads as alive; the next spawn only happens once that process is
//! gone too.

/// Decides whether a recorded process identifier still denotes a running process.
pub trait LivenessProbe: Send + Sync {
    /// Return `true` if `pid` is present and a process with that id exists.
    ///
    /// Absence of the process is an ordinary `false`, never an error.
    fn is_alive(&self, pid: Option<u32>) -> bool;
}

/// [`LivenessProbe`] backed by the OS process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTable;

impl LivenessProbe for ProcessTable {
    fn is_alive(&self, pid: Option<u32>) -> bool {
        pid.is_some_and(pid_exists)
    }
}

/// Signal 0 probes for existence without delivering anything. `EPERM`
/// means the process exists but belongs to someone else.
#[cfg(unix)]
fn pid_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

// TODO: query the process table on Windows (OpenProcess + GetExitCodeProcess);
// until then every recorded session is treated as stale and respawned.
#[cfg(not(unix))]
fn pid_exists(_pid: u32) -> bool {
    false
}
