//! Process registry: role name → process identity directory.
//!
//! The registry is the only discovery mechanism in DroneGrid. Every
//! participant publishes itself once at startup and blocks until the
//! supervisor's identity is visible (the startup barrier); the supervisor
//! re-reads the whole directory on every monitoring cycle to learn who it
//! must probe.
//!
//! # File format
//!
//! ```text
//! SUPERVISOR_PID 4120
//! COORDINATOR_PID 4123
//! PHYSICS_PID 4125
//! ```
//!
//! One `"<ROLE_TAG> <identity>"` line per participant. The file is truncated
//! once per run by the orchestrator and appended to under an exclusive
//! advisory lock afterwards. Reads take a shared lock, so they never observe
//! a withdrawal's rewrite half done, and ignore any trailing line that is not
//! yet newline-terminated.

use crate::error::EnvError;
use crate::types::{Pid, Role};
use crate::GridContext;

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Default backoff between discovery attempts.
pub const DISCOVERY_BACKOFF: Duration = Duration::from_millis(200);

/// One published participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub role: Role,
    pub pid: Pid,
}

impl RegistryEntry {
    pub fn new(role: Role, pid: Pid) -> Self {
        Self { role, pid }
    }

    /// Formats the entry as a registry line, newline included.
    pub fn to_line(&self) -> String {
        format!("{} {}\n", self.role.tag(), self.pid)
    }

    /// Parses a single registry line.
    ///
    /// Returns `None` for lines with an unknown role tag so that a newer
    /// participant kind never breaks an older reader.
    pub fn parse_line(line: &str) -> Result<Option<Self>, EnvError> {
        let mut parts = line.split_whitespace();
        let (Some(tag), Some(identity), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(EnvError::malformed(format!("registry line '{}'", line.trim_end())));
        };
        let Some(role) = Role::from_tag(tag) else {
            return Ok(None);
        };
        Ok(Some(Self::new(role, identity.parse()?)))
    }
}

/// Parses complete (newline-terminated) lines out of a registry snapshot.
pub fn parse_snapshot(content: &str) -> Vec<RegistryEntry> {
    content
        .split_inclusive('\n')
        .filter(|line| line.ends_with('\n'))
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match RegistryEntry::parse_line(line) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping registry line: {}", e);
                None
            }
        })
        .collect()
}

/// Service-discovery boundary shared by every participant.
pub trait Registry: Send + Sync {
    /// Empties the registry. Called once per run before any component starts.
    fn reset(&self) -> Result<(), EnvError>;

    /// Appends one entry, atomically with respect to concurrent publishers.
    fn publish(&self, role: Role, pid: Pid) -> Result<(), EnvError>;

    /// Removes a participant's entry on clean exit.
    ///
    /// Returns `true` if a matching entry was present.
    fn withdraw(&self, role: Role, pid: Pid) -> Result<bool, EnvError>;

    /// Re-reads the full membership.
    ///
    /// A registry that does not exist yet reads as empty.
    fn refresh(&self) -> Result<Vec<RegistryEntry>, EnvError>;

    /// Returns the first identity published under `role`, if any.
    fn lookup(&self, role: Role) -> Result<Option<Pid>, EnvError> {
        Ok(self
            .refresh()?
            .into_iter()
            .find(|entry| entry.role == role)
            .map(|entry| entry.pid))
    }
}

/// Blocks until `role` has published itself, retrying every `backoff`.
///
/// This is the startup barrier: a lookup that finds nothing, or fails to
/// read, is never escalated.
pub async fn discover<Ctx: GridContext + ?Sized>(
    registry: &dyn Registry,
    role: Role,
    backoff: Duration,
    ctx: &Ctx,
) -> Pid {
    let mut attempts: u64 = 0;
    loop {
        match registry.lookup(role) {
            Ok(Some(pid)) => {
                debug!(%role, %pid, attempts, "Discovered participant");
                return pid;
            }
            Ok(None) => {}
            Err(e) => debug!(%role, "Registry not readable yet: {}", e),
        }
        attempts += 1;
        ctx.sleep(backoff).await;
    }
}

/// Registry stored in a line-oriented text file.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Registry for FileRegistry {
    fn reset(&self) -> Result<(), EnvError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        File::create(&self.path)?;
        Ok(())
    }

    fn publish(&self, role: Role, pid: Pid) -> Result<(), EnvError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let _lock = FileLock::exclusive(&file)?;
        (&file).write_all(RegistryEntry::new(role, pid).to_line().as_bytes())?;
        (&file).flush()?;
        debug!(%role, %pid, path = %self.path.display(), "Published to registry");
        Ok(())
    }

    fn withdraw(&self, role: Role, pid: Pid) -> Result<bool, EnvError> {
        let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let _lock = FileLock::exclusive(&file)?;

        let mut content = String::new();
        (&file).read_to_string(&mut content)?;

        let target = RegistryEntry::new(role, pid);
        let mut removed = false;
        let kept: String = content
            .split_inclusive('\n')
            .filter(|line| {
                let matches = matches!(RegistryEntry::parse_line(line), Ok(Some(entry)) if entry == target);
                removed |= matches;
                !matches
            })
            .collect();

        if removed {
            file.set_len(0)?;
            (&file).seek(SeekFrom::Start(0))?;
            (&file).write_all(kept.as_bytes())?;
            (&file).flush()?;
            debug!(%role, %pid, "Withdrawn from registry");
        }
        Ok(removed)
    }

    fn refresh(&self) -> Result<Vec<RegistryEntry>, EnvError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                debug!(path = %self.path.display(), "Registry not populated yet: {}", e);
                return Ok(Vec::new());
            }
        };
        // Shared lock: a concurrent withdraw truncates and rewrites under LOCK_EX.
        let _lock = FileLock::shared(&file)?;
        let mut content = String::new();
        (&file).read_to_string(&mut content)?;
        Ok(parse_snapshot(&content))
    }
}

/// `flock(2)` held for the guard's lifetime.
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> Result<Self, EnvError> {
        Self::acquire(file, libc::LOCK_EX)
    }

    fn shared(file: &'a File) -> Result<Self, EnvError> {
        Self::acquire(file, libc::LOCK_SH)
    }

    fn acquire(file: &'a File, operation: libc::c_int) -> Result<Self, EnvError> {
        loop {
            // SAFETY: the descriptor is owned by `file`, which outlives the guard.
            let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
            if rc == 0 {
                return Ok(Self { file });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(EnvError::OsCall {
                    call: "flock",
                    source: err,
                });
            }
        }
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        // SAFETY: see `acquire`.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!("Failed to release registry lock: {}", std::io::Error::last_os_error());
        }
    }
}

/// In-process registry, for tests and single-process harnesses.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: Mutex<Vec<RegistryEntry>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<RegistryEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Registry for MemoryRegistry {
    fn reset(&self) -> Result<(), EnvError> {
        self.entries().clear();
        Ok(())
    }

    fn publish(&self, role: Role, pid: Pid) -> Result<(), EnvError> {
        self.entries().push(RegistryEntry::new(role, pid));
        Ok(())
    }

    fn withdraw(&self, role: Role, pid: Pid) -> Result<bool, EnvError> {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|entry| *entry != RegistryEntry::new(role, pid));
        Ok(entries.len() != before)
    }

    fn refresh(&self) -> Result<Vec<RegistryEntry>, EnvError> {
        Ok(self.entries().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{mpsc, Arc};
    use std::thread;

    #[test]
    fn test_parse_snapshot_ignores_partial_tail() {
        let content = "SUPERVISOR_PID 10\nPHYSICS_PID 11\nTARGET_PID 1";
        let entries = parse_snapshot(content);
        assert_eq!(
            entries,
            vec![
                RegistryEntry::new(Role::Supervisor, Pid(10)),
                RegistryEntry::new(Role::Physics, Pid(11)),
            ]
        );
    }

    #[test]
    fn test_parse_snapshot_skips_unknown_and_garbage() {
        let content = "INPUT_PID 9\nnot a line at all\nCOORDINATOR_PID x\nRELAY_PID 12\n";
        assert_eq!(
            parse_snapshot(content),
            vec![RegistryEntry::new(Role::Relay, Pid(12))]
        );
    }

    #[test]
    fn test_file_registry_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("absent.txt"));
        assert!(registry.refresh().unwrap().is_empty());
        assert_eq!(registry.lookup(Role::Supervisor).unwrap(), None);
    }

    #[test]
    fn test_file_registry_publish_lookup_withdraw() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("registry.txt"));
        registry.reset().unwrap();

        registry.publish(Role::Supervisor, Pid(100)).unwrap();
        registry.publish(Role::Physics, Pid(101)).unwrap();
        registry.publish(Role::TargetGenerator, Pid(102)).unwrap();

        assert_eq!(registry.lookup(Role::Physics).unwrap(), Some(Pid(101)));
        assert!(registry.withdraw(Role::Physics, Pid(101)).unwrap());
        assert!(!registry.withdraw(Role::Physics, Pid(101)).unwrap());
        assert_eq!(registry.lookup(Role::Physics).unwrap(), None);

        let remaining = registry.refresh().unwrap();
        assert_eq!(remaining.len(), 2);
        let raw = fs::read_to_string(registry.path()).unwrap();
        assert_eq!(raw, "SUPERVISOR_PID 100\nTARGET_PID 102\n");
    }

    #[test]
    fn test_refresh_waits_for_rewrite_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FileRegistry::new(dir.path().join("registry.txt")));
        registry.reset().unwrap();
        registry.publish(Role::Supervisor, Pid(1)).unwrap();
        registry.publish(Role::Physics, Pid(2)).unwrap();

        // Another process mid-withdraw: exclusive lock held, file emptied.
        let writer = OpenOptions::new().read(true).write(true).open(registry.path()).unwrap();
        let lock = FileLock::exclusive(&writer).unwrap();
        writer.set_len(0).unwrap();

        let (tx, rx) = mpsc::channel();
        let reader = Arc::clone(&registry);
        let handle = thread::spawn(move || tx.send(reader.refresh().unwrap()).unwrap());

        thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err(), "refresh read a half-rewritten registry");

        (&writer).write_all(b"SUPERVISOR_PID 1\nPHYSICS_PID 2\n").unwrap();
        drop(lock);

        let entries = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_reset_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("nested/registry.txt"));
        registry.publish(Role::Supervisor, Pid(1)).unwrap_err();
        registry.reset().unwrap();
        registry.publish(Role::Supervisor, Pid(1)).unwrap();
        registry.reset().unwrap();
        assert!(registry.refresh().unwrap().is_empty());
    }

    #[test]
    fn test_memory_registry_lookup_returns_first() {
        let registry = MemoryRegistry::new();
        registry.publish(Role::Coordinator, Pid(5)).unwrap();
        registry.publish(Role::Coordinator, Pid(6)).unwrap();
        assert_eq!(registry.lookup(Role::Coordinator).unwrap(), Some(Pid(5)));
    }

    proptest! {
        #[test]
        fn prop_entry_line_parses_back(idx in 0usize..Role::ALL.len(), pid in any::<u32>()) {
            let entry = RegistryEntry::new(Role::ALL[idx], Pid(pid));
            let parsed = RegistryEntry::parse_line(&entry.to_line()).unwrap();
            prop_assert_eq!(parsed, Some(entry));
        }
    }
}
