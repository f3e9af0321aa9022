//! Command-line encoding of the channel handles a child inherits.

use dronegrid_env::{ChannelFd, EnvError, Role};
use std::fmt;
use std::str::FromStr;

/// One framed link as seen by the process that owns it.
///
/// Written `role:rx:tx`, with `-` for a missing direction:
/// `physics:7:10`, `relay:12:-`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSpec {
    pub role: Role,
    /// Handle this process reads from
    pub rx: Option<ChannelFd>,
    /// Handle this process writes to
    pub tx: Option<ChannelFd>,
}

impl LinkSpec {
    pub fn new(role: Role, rx: Option<ChannelFd>, tx: Option<ChannelFd>) -> Self {
        Self { role, rx, tx }
    }

    /// Handles that must survive `exec`.
    pub fn fds(&self) -> impl Iterator<Item = ChannelFd> {
        self.rx.into_iter().chain(self.tx)
    }
}

fn parse_end(field: &str) -> Result<Option<ChannelFd>, EnvError> {
    match field {
        "-" => Ok(None),
        other => other.parse().map(Some),
    }
}

fn show_end(end: &Option<ChannelFd>) -> String {
    end.map(|fd| fd.to_string()).unwrap_or_else(|| "-".to_string())
}

impl FromStr for LinkSpec {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        let [role, rx, tx] = fields.as_slice() else {
            return Err(EnvError::malformed(format!("link '{}' is not role:rx:tx", s)));
        };
        let spec = Self {
            role: role.parse()?,
            rx: parse_end(rx)?,
            tx: parse_end(tx)?,
        };
        if spec.rx.is_none() && spec.tx.is_none() {
            return Err(EnvError::malformed(format!("link '{}' has no handles", s)));
        }
        Ok(spec)
    }
}

impl fmt::Display for LinkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.role.name(), show_end(&self.rx), show_end(&self.tx))
    }
}
