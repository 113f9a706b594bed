//! Process probing and signal delivery by PID.
//!
//! Spawned children are usually reached through their `Child` handle; these
//! helpers cover processes the supervisor only knows by PID (adopted
//! survivors, the lockfile holder).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Whether a process with this PID exists.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence; EPERM means it exists but is not ours.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    false
}

/// Deliver `signal` to `pid`. Returns false if the process is already gone.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe { libc::kill(pid, signo) == 0 }
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _signal: Signal) -> bool {
    false
}

/// Best-effort check that `pid` is one of our own subprocesses, so a recycled
/// PID is not mistaken for a survivor.
#[cfg(target_os = "linux")]
pub fn cmdline_contains(pid: u32, needle: &str) -> bool {
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => raw
            .split(|b| *b == 0)
            .any(|arg| arg == needle.as_bytes()),
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn cmdline_contains(_pid: u32, _needle: &str) -> bool {
    true
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn nonsense_pids_are_not_running() {
        assert!(!is_process_running(0));
        assert!(!is_process_running(u32::MAX));
    }

    #[test]
    fn terminate_stops_a_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(send_signal(pid, Signal::Terminate));
        child.wait().unwrap();
        assert!(!is_process_running(pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn cmdline_matches_whole_arguments() {
        let mut child = std::process::Command::new("sleep").arg("31").spawn().unwrap();
        // the exec'd command line can lag the spawn slightly
        for _ in 0..50 {
            if cmdline_contains(child.id(), "sleep") {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(cmdline_contains(child.id(), "31"));
        assert!(!cmdline_contains(child.id(), "3"));
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
