//! Common types shared by every DroneGrid participant.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EnvError;

/// Identity of a participant process.
///
/// This is the OS process id; it is what gets published to the registry and
/// what the group kill targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl Pid {
    /// Identity of the calling process.
    pub fn current() -> Self {
        Self(std::process::id())
    }

    /// Returns the raw process id.
    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Pid {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(Pid)
            .map_err(|_| EnvError::malformed(format!("invalid process identity '{}'", s)))
    }
}

/// Symbolic role a participant plays in the system.
///
/// At most one live registry record exists per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Heartbeat failure detector
    Supervisor,
    /// Central coordinator owning the world state
    Coordinator,
    /// Drone dynamics integrator
    Physics,
    /// Procedural obstacle placement
    ObstacleGenerator,
    /// Procedural target placement
    TargetGenerator,
    /// Two-instance network relay
    Relay,
}

impl Role {
    /// Every role, supervisor first.
    pub const ALL: [Role; 6] = [
        Role::Supervisor,
        Role::Coordinator,
        Role::Physics,
        Role::ObstacleGenerator,
        Role::TargetGenerator,
        Role::Relay,
    ];

    /// Tag written in front of the identity in a registry line.
    pub fn tag(&self) -> &'static str {
        match self {
            Role::Supervisor => "SUPERVISOR_PID",
            Role::Coordinator => "COORDINATOR_PID",
            Role::Physics => "PHYSICS_PID",
            Role::ObstacleGenerator => "OBSTACLE_PID",
            Role::TargetGenerator => "TARGET_PID",
            Role::Relay => "RELAY_PID",
        }
    }

    /// Short lowercase name, used for log files and CLI values.
    pub fn name(&self) -> &'static str {
        match self {
            Role::Supervisor => "supervisor",
            Role::Coordinator => "coordinator",
            Role::Physics => "physics",
            Role::ObstacleGenerator => "obstacles",
            Role::TargetGenerator => "targets",
            Role::Relay => "relay",
        }
    }

    /// Looks a role up by its registry tag.
    pub fn from_tag(tag: &str) -> Option<Role> {
        Role::ALL.iter().copied().find(|role| role.tag() == tag)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Role {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .iter()
            .copied()
            .find(|role| role.name() == s || role.tag() == s)
            .ok_or_else(|| EnvError::malformed(format!("unknown role '{}'", s)))
    }
}

/// A grid cell, as carried in bulk point records.
///
/// The wire layout is two native-width `i32`s, `x` then `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    /// Size of one encoded point record in bytes.
    pub const WIRE_SIZE: usize = 8;

    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The cell a continuous position falls into (truncation toward zero).
    pub fn from_position(x: f32, y: f32) -> Self {
        Self {
            x: x as i32,
            y: y as i32,
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_tag_lookup() {
        for role in Role::ALL {
            assert_eq!(Role::from_tag(role.tag()), Some(role));
            assert_eq!(role.name().parse::<Role>().unwrap(), role);
        }
        assert_eq!(Role::from_tag("WATCHDOG"), None);
    }

    #[test]
    fn test_pid_parse() {
        assert_eq!("4242".parse::<Pid>().unwrap(), Pid(4242));
        assert!("-1".parse::<Pid>().is_err());
        assert!("abc".parse::<Pid>().is_err());
    }

    #[test]
    fn test_point_from_position_truncates() {
        assert_eq!(Point::from_position(3.9, 7.1), Point::new(3, 7));
        assert_eq!(Point::from_position(0.2, 0.99), Point::new(0, 0));
    }
}
