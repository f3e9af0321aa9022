//! Process-level actions: liveness checks and the group kill.

use crate::error::EnvError;
use crate::registry::RegistryEntry;
use crate::types::Pid;

use tracing::{error, warn};

/// Terminates every participant after a liveness failure.
///
/// Implementations are expected not to return in production (the caller is
/// part of the group); test doubles record the call instead.
pub trait GroupKill: Send + Sync {
    fn kill_group(&self, members: &[RegistryEntry]) -> Result<(), EnvError>;
}

/// Kills every registered process, then the caller's whole process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupKill;

impl GroupKill for ProcessGroupKill {
    fn kill_group(&self, members: &[RegistryEntry]) -> Result<(), EnvError> {
        for member in members {
            if member.pid == Pid::current() {
                continue;
            }
            if let Err(e) = signal(member.pid, libc::SIGKILL) {
                // Already gone is fine; anything else is worth a line in the log.
                warn!(role = %member.role, pid = %member.pid, "Kill failed: {}", e);
            }
        }
        error!("Terminating process group");
        // SAFETY: kill(0, ..) targets the caller's own process group.
        if unsafe { libc::kill(0, libc::SIGKILL) } != 0 {
            return Err(EnvError::last_os_error("kill(0)"));
        }
        Ok(())
    }
}

/// Sends `sig` to `pid`.
pub fn signal(pid: Pid, sig: libc::c_int) -> Result<(), EnvError> {
    let raw = libc::pid_t::try_from(pid.as_raw())
        .map_err(|_| EnvError::malformed(format!("pid {} out of range", pid)))?;
    // SAFETY: kill(2) has no memory-safety requirements.
    if unsafe { libc::kill(raw, sig) } != 0 {
        return Err(EnvError::last_os_error("kill"));
    }
    Ok(())
}

/// Whether a process with this identity currently exists.
pub fn is_alive(pid: Pid) -> bool {
    match signal(pid, 0) {
        Ok(()) => true,
        // EPERM means it exists but belongs to someone else.
        Err(EnvError::OsCall { source, .. }) => source.raw_os_error() == Some(libc::EPERM),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(Pid::current()));
    }

    #[test]
    fn test_out_of_range_pid_is_rejected() {
        assert!(signal(Pid(u32::MAX), 0).is_err());
        assert!(!is_alive(Pid(u32::MAX)));
    }
}
