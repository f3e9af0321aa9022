//! OS byte channels between participant processes.
//!
//! Every producer/consumer relationship is one unidirectional pipe. The
//! orchestrator creates all of them close-on-exec, and each child only
//! inherits the ends it was handed on its command line:
//!
//! ```text
//! orchestrator                      child (re-exec'd with `--physics-rx 7`)
//!   Pipe::new() -> (r=7, w=8)
//!   spawn(pre_exec: inherit([7]))  ─► fd 7 survives exec, fd 8 does not
//!   drop(Pipe)                        ChannelFd(7).into_reader()
//! ```

use crate::error::EnvError;

use std::fmt;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::str::FromStr;
use tokio::net::unix::pipe;

/// A unidirectional pipe with both ends marked close-on-exec.
#[derive(Debug)]
pub struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl Pipe {
    /// Creates a new pipe.
    pub fn new() -> Result<Self, EnvError> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        // SAFETY: `fds` is a valid two-element buffer for pipe(2) to fill.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(EnvError::last_os_error("pipe"));
        }
        // SAFETY: pipe(2) succeeded, both descriptors are fresh and owned by us.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_cloexec(read.as_raw_fd(), true)?;
        set_cloexec(write.as_raw_fd(), true)?;
        Ok(Self { read, write })
    }

    /// Handle number of the read end.
    pub fn read_fd(&self) -> ChannelFd {
        ChannelFd(self.read.as_raw_fd())
    }

    /// Handle number of the write end.
    pub fn write_fd(&self) -> ChannelFd {
        ChannelFd(self.write.as_raw_fd())
    }
}

/// Sets or clears `FD_CLOEXEC` on a descriptor.
pub fn set_cloexec(fd: RawFd, enabled: bool) -> Result<(), EnvError> {
    // SAFETY: fcntl on a descriptor number has no memory-safety requirements.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(EnvError::last_os_error("fcntl(F_GETFD)"));
    }
    let updated = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, updated) } < 0 {
        return Err(EnvError::last_os_error("fcntl(F_SETFD)"));
    }
    Ok(())
}

/// Clears close-on-exec on `fds` between fork and exec.
///
/// Only calls `fcntl`, which is async-signal-safe, so it may run inside a
/// `pre_exec` hook.
pub fn inherit(fds: &[RawFd]) -> std::io::Result<()> {
    for &fd in fds {
        // SAFETY: fcntl is async-signal-safe and touches no Rust-managed memory.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// A channel handle number as passed between processes on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelFd(pub RawFd);

impl ChannelFd {
    pub fn as_raw(&self) -> RawFd {
        self.0
    }

    /// Adopts the inherited descriptor as an async pipe reader.
    ///
    /// Must be called from within a Tokio runtime, at most once per handle.
    pub fn into_reader(self) -> Result<pipe::Receiver, EnvError> {
        pipe::Receiver::from_file(self.adopt()?)
            .map_err(|e| EnvError::channel(format!("fd {} is not a readable pipe: {}", self.0, e)))
    }

    /// Adopts the inherited descriptor as an async pipe writer.
    ///
    /// Must be called from within a Tokio runtime, at most once per handle.
    pub fn into_writer(self) -> Result<pipe::Sender, EnvError> {
        pipe::Sender::from_file(self.adopt()?)
            .map_err(|e| EnvError::channel(format!("fd {} is not a writable pipe: {}", self.0, e)))
    }

    fn adopt(self) -> Result<File, EnvError> {
        // SAFETY: fcntl only inspects the descriptor table.
        if self.0 < 0 || unsafe { libc::fcntl(self.0, libc::F_GETFD) } < 0 {
            return Err(EnvError::channel(format!("fd {} is not open", self.0)));
        }
        // The descriptor was inherited for this process alone and is adopted once.
        // SAFETY: validity checked above; ownership transfers to the File.
        let fd = unsafe { OwnedFd::from_raw_fd(self.0) };
        set_cloexec(fd.as_raw_fd(), true)?;
        Ok(File::from(fd))
    }
}

impl fmt::Display for ChannelFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChannelFd {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<RawFd>()
            .ok()
            .filter(|fd| *fd >= 0)
            .map(ChannelFd)
            .ok_or_else(|| EnvError::channel(format!("invalid channel handle '{}'", s)))
    }
}
