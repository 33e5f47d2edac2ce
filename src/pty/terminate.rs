//! Process-group teardown for PTY children.
//!
//! PTY-launched commands run in their own session/process group, so group
//! signals are scoped to that terminal's process tree only.

use std::sync::mpsc;
use std::time::Duration;

use anyhow::{bail, Result};
use log::debug;

/// Deadline for the process to be reaped after SIGKILL.
const KILL_WAIT: Duration = Duration::from_millis(1500);

type ChildHandle = Box<dyn portable_pty::Child + Send + Sync>;

/// Terminate `child` and everything it spawned: SIGTERM to the group, a
/// grace window, SIGKILL to the group, then a bounded wait for the reap.
#[cfg(unix)]
pub fn terminate_tree(mut child: ChildHandle, pid: Option<u32>, grace: Duration) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = child.wait();
        let _ = tx.send(());
    });

    if let Some(pid) = pid {
        signal_group(pid, libc::SIGTERM);
    }
    if rx.recv_timeout(grace).is_ok() {
        return Ok(());
    }

    debug!("process group {pid:?} survived SIGTERM, escalating");
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGKILL);
    }
    if rx.recv_timeout(KILL_WAIT).is_ok() {
        return Ok(());
    }
    bail!("timed out waiting for process tree to exit")
}

/// Signal the process group, falling back to the single process when the
/// group is already gone.
#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) {
    let pid = pid as libc::pid_t;
    let rc = unsafe { libc::kill(-pid, sig) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            unsafe {
                libc::kill(pid, sig);
            }
        }
    }
}

/// Windows ladder: a console interrupt plays the SIGINT role, then kill.
#[cfg(windows)]
pub fn terminate_tree(child: ChildHandle, pid: Option<u32>, grace: Duration) -> Result<()> {
    use portable_pty::ChildKiller;
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

    // Keep a kill handle; the child itself moves into the reaper thread.
    let mut killer = child.clone_killer();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut child = child;
        let _ = child.wait();
        let _ = tx.send(());
    });

    // CTRL_BREAK is deliverable to a process group id, mirroring the unix
    // group SIGTERM.
    if let Some(pid) = pid {
        unsafe {
            GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
        }
    }
    if rx.recv_timeout(grace).is_ok() {
        return Ok(());
    }

    debug!("process {pid:?} survived console interrupt, escalating");
    let _ = killer.kill();
    if rx.recv_timeout(KILL_WAIT).is_ok() {
        Ok(())
    } else {
        bail!("timed out waiting for process to exit")
    }
}
