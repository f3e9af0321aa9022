//! DroneGrid Core Library
//!
//! The process-supervision and coordination substrate of DroneGrid:
//!
//! - **Protocol**: fixed-size typed frames with length-aware bulk bodies
//! - **Coordinator**: single-threaded reactor owning the authoritative world
//!   state and fanning updates out to dependents
//! - **Detector**: sequential heartbeat probes with a hard per-participant
//!   timeout and an all-or-nothing group kill
//!
//! Every process uses the same framing and registry primitives, so the
//! coordinator is itself one of the detector's monitored participants.

pub mod coordinator;
pub mod detector;
pub mod error;
pub mod heartbeat;
pub mod link;
pub mod membership;
pub mod protocol;
pub mod render;
pub mod world;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorLinks, CoordinatorSummary, Flow, Phase};
pub use detector::{CycleReport, DetectorConfig, DetectorOutcome, HeartbeatDetector, ParticipantRecord};
pub use error::{CoreError, FrameError};
pub use heartbeat::{respond_to_heartbeats, ControlLink, ControlLinks, LivenessProbe, ProbeOutcome};
pub use link::{frame_reader, frame_writer, FrameReader, FrameWriter};
pub use membership::Membership;
pub use protocol::{ForceReport, Frame, FrameCodec, FrameKind, Message, MAX_BULK_RECORDS};
pub use render::{ChannelUi, NullRenderer, Renderer, TraceRenderer, UiEvent, UiSource};
pub use world::{TargetContact, WorldState, MAX_PLACEMENT_ATTEMPTS};
