//! Heartbeat protocol over dedicated control channels.
//!
//! Each monitored participant has one control channel pair with the
//! supervisor. The supervisor writes `PING <seq>` and waits, with a hard
//! deadline, for `PONG <seq>`; the participant's [`respond_to_heartbeats`]
//! task answers every ping as soon as it is read.

use crate::link::{send, FrameReader, FrameWriter};
use crate::protocol::Message;

use async_trait::async_trait;
use dronegrid_env::Role;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Result of probing one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Answered within the deadline, after this round trip
    Acknowledged(Duration),
    /// No matching answer before the deadline
    TimedOut,
    /// The control channel is closed or broken
    Disconnected,
    /// No control channel exists for this role
    Unreachable,
}

impl ProbeOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, ProbeOutcome::Acknowledged(_))
    }
}

/// Sends one liveness probe and waits for the answer.
#[async_trait]
pub trait LivenessProbe: Send {
    async fn probe(&mut self, role: Role, timeout: Duration) -> ProbeOutcome;
}

/// Supervisor end of one participant's control channel.
pub struct ControlLink {
    tx: FrameWriter,
    rx: FrameReader,
    next_seq: u64,
}

impl ControlLink {
    pub fn new(tx: FrameWriter, rx: FrameReader) -> Self {
        Self { tx, rx, next_seq: 0 }
    }

    /// Pings and waits for the matching pong, all within `timeout`.
    ///
    /// Stale pongs from earlier probes are discarded without extending the
    /// deadline.
    pub async fn ping(&mut self, timeout: Duration) -> ProbeOutcome {
        self.next_seq += 1;
        let seq = self.next_seq;
        let started = Instant::now();
        let deadline = started + timeout;

        match tokio::time::timeout_at(deadline, send(&mut self.tx, Message::Ping(seq))).await {
            Err(_) => return ProbeOutcome::TimedOut,
            Ok(Err(e)) => {
                debug!(seq, "Ping write failed: {}", e);
                return ProbeOutcome::Disconnected;
            }
            Ok(Ok(())) => {}
        }

        loop {
            let next = match tokio::time::timeout_at(deadline, self.rx.next()).await {
                Err(_) => return ProbeOutcome::TimedOut,
                Ok(next) => next,
            };
            match next {
                None => return ProbeOutcome::Disconnected,
                Some(Err(e)) => {
                    warn!(seq, "Control channel framing error: {}", e);
                    return ProbeOutcome::Disconnected;
                }
                Some(Ok(frame)) => match frame.into_message() {
                    Ok(Message::Pong(answer)) if answer == seq => {
                        return ProbeOutcome::Acknowledged(started.elapsed());
                    }
                    Ok(Message::Pong(stale)) => trace!(seq, stale, "Discarding stale pong"),
                    Ok(other) => trace!(kind = %other.kind(), "Ignoring non-pong on control channel"),
                    Err(e) => debug!("Dropping unreadable control frame: {}", e),
                },
            }
        }
    }
}

/// Control links for every monitored role.
#[derive(Default)]
pub struct ControlLinks {
    links: HashMap<Role, ControlLink>,
}

impl ControlLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: Role, link: ControlLink) {
        self.links.insert(role, link);
    }

    pub fn with(mut self, role: Role, tx: FrameWriter, rx: FrameReader) -> Self {
        self.insert(role, ControlLink::new(tx, rx));
        self
    }

    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.links.keys().copied()
    }
}

#[async_trait]
impl LivenessProbe for ControlLinks {
    async fn probe(&mut self, role: Role, timeout: Duration) -> ProbeOutcome {
        match self.links.get_mut(&role) {
            Some(link) => link.ping(timeout).await,
            None => ProbeOutcome::Unreachable,
        }
    }
}

/// Participant side: answers every ping until the supervisor hangs up.
///
/// Returns the number of pings answered.
pub async fn respond_to_heartbeats(mut rx: FrameReader, mut tx: FrameWriter) -> u64 {
    let mut answered = 0;
    while let Some(next) = rx.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Heartbeat channel framing error: {}", e);
                break;
            }
        };
        match frame.into_message() {
            Ok(Message::Ping(seq)) => {
                if let Err(e) = send(&mut tx, Message::Pong(seq)).await {
                    debug!(seq, "Pong write failed: {}", e);
                    break;
                }
                answered += 1;
            }
            Ok(Message::Exit) => break,
            Ok(other) => trace!(kind = %other.kind(), "Ignoring frame on heartbeat channel"),
            Err(e) => debug!("Dropping unreadable heartbeat frame: {}", e),
        }
    }
    debug!(answered, "Heartbeat responder stopped");
    answered
}
