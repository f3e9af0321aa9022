//! DroneGrid Environment Abstraction Layer
//!
//! This crate holds everything a DroneGrid participant needs from the host
//! before it can speak the frame protocol:
//!
//! - Time and randomness (`GridContext`), so timing policies are testable
//!   with a paused clock and every run is reproducible from one seed
//! - Process identity and roles (`Pid`, `Role`)
//! - The process registry used for startup discovery (`Registry`)
//! - OS pipes and handle hand-off across `exec` (`Pipe`, `ChannelFd`)
//! - The group kill used by the supervisor (`GroupKill`)
//!
//! # Example
//!
//! ```ignore
//! use dronegrid_env::{discover, FileRegistry, Pid, Registry, Role, TokioContext};
//!
//! let ctx = TokioContext::new(seed);
//! let registry = FileRegistry::new("pid_registry.txt");
//! let supervisor = discover(&registry, Role::Supervisor, DISCOVERY_BACKOFF, &ctx).await;
//! registry.publish(Role::Physics, Pid::current())?;
//! ```

mod context;
mod error;
mod tokio_impl;
mod types;

pub mod channel;
pub mod process;
pub mod registry;

pub use channel::{ChannelFd, Pipe};
pub use context::GridContext;
pub use error::EnvError;
pub use process::{GroupKill, ProcessGroupKill};
pub use registry::{discover, FileRegistry, MemoryRegistry, Registry, RegistryEntry, DISCOVERY_BACKOFF};
pub use tokio_impl::TokioContext;
pub use types::{Pid, Point, Role};
