//! Delivering a termination signal to the runner's process tree.

use std::collections::{HashMap, VecDeque};

use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::Pid;

use super::serve::RunnerError;

/// Delivers a signal received over the runner's input channel.
pub trait SignalDelivery: Send + Sync {
    fn deliver(&self, signal: Signal) -> Result<(), RunnerError>;
}

/// Signals every descendant of this process, then this process itself.
pub struct OsSignalDelivery;

impl SignalDelivery for OsSignalDelivery {
    fn deliver(&self, sig: Signal) -> Result<(), RunnerError> {
        let me = std::process::id() as i32;
        let children = descendants(me)?;
        tracing::info!("delivering {} to {} descendant(s) and self", sig, children.len());

        for pid in children {
            // The process may have exited since the scan.
            if let Err(e) = signal::kill(Pid::from_raw(pid), sig) {
                tracing::debug!("kill {} {}: {}", sig, pid, e);
            }
        }

        // The runner may be ignoring this signal; it must still take effect.
        // SAFETY: installs the default disposition; no handler code runs.
        unsafe { signal::signal(sig, SigHandler::SigDfl) }.map_err(|e| RunnerError::Signal(e.to_string()))?;
        signal::kill(Pid::from_raw(me), sig).map_err(|e| RunnerError::Signal(e.to_string()))
    }
}

/// All descendants of `root`, parents before children.
pub fn descendants(root: i32) -> Result<Vec<i32>, RunnerError> {
    let all = procfs::process::all_processes().map_err(|e| RunnerError::Signal(format!("failed to read /proc: {}", e)))?;

    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for proc_result in all {
        // Processes may exit while we scan.
        let Ok(proc) = proc_result else { continue };
        let Ok(stat) = proc.stat() else { continue };
        children.entry(stat.ppid).or_default().push(stat.pid);
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or_default() {
            found.push(child);
            queue.push_back(child);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_spawned_child() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let found = descendants(std::process::id() as i32).unwrap();
        let _ = child.kill();
        let _ = child.wait();
        assert!(found.contains(&(child.id() as i32)));
    }

    #[test]
    fn test_leaf_has_no_descendants() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let found = descendants(child.id() as i32).unwrap();
        let _ = child.kill();
        let _ = child.wait();
        assert!(found.is_empty());
    }
}
