//! DroneGrid launcher and simulation collaborators
//!
//! Everything here runs inside the `dronegrid` binary, one process per
//! component:
//!
//! ```text
//! dronegrid run ─┬─► dronegrid supervisor   (heartbeat detector)
//!                ├─► dronegrid coordinator  (world state, terminal)
//!                ├─► dronegrid physics      (potential-field drone)
//!                ├─► dronegrid obstacles    (obstacle generator)
//!                └─► dronegrid targets      (target generator)
//! ```
//!
//! The coordinator and supervisor logic lives in `dronegrid_core`; this
//! crate adds process wiring, logging, the terminal front end and the
//! collaborators the coordinator talks to.

pub mod component;
pub mod generators;
pub mod logging;
pub mod orchestrator;
pub mod physics;
pub mod supervisor;
pub mod terminal;
pub mod wiring;

pub use component::{HeartbeatFds, Participant};
pub use generators::{run_generator, GeneratorConfig, ObstacleGenerator, TargetGenerator};
pub use logging::{init_logging, LogTarget};
pub use orchestrator::{RunConfig, RunSummary, Wiring};
pub use physics::{run_physics, DronePhysics, PhysicsConfig};
pub use supervisor::run_supervisor;
pub use terminal::{TerminalRenderer, TerminalUi};
pub use wiring::LinkSpec;

/// RNG stream of the obstacle generator.
pub const OBSTACLE_RNG_STREAM: u64 = 2;

/// RNG stream of the target generator.
pub const TARGET_RNG_STREAM: u64 = 3;
