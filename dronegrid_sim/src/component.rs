//! Participant runtime shared by every monitored component.
//!
//! Lifecycle: adopt the heartbeat channel and start answering pings, join
//! the registry once the supervisor is up, run the component body, then
//! withdraw before the heartbeat responder goes away.

use anyhow::{Context, Result};
use dronegrid_core::{frame_reader, frame_writer, respond_to_heartbeats, CoreError, Membership};
use dronegrid_env::{ChannelFd, GridContext, Pid, Registry, Role, DISCOVERY_BACKOFF};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Inherited control channel to the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatFds {
    /// Pings arrive here
    pub rx: ChannelFd,
    /// Pongs go here
    pub tx: ChannelFd,
}

impl HeartbeatFds {
    /// Both handles, or none. A single handle is a wiring error.
    pub fn from_pair(rx: Option<ChannelFd>, tx: Option<ChannelFd>) -> Result<Option<Self>> {
        match (rx, tx) {
            (Some(rx), Some(tx)) => Ok(Some(Self { rx, tx })),
            (None, None) => Ok(None),
            _ => anyhow::bail!("--heartbeat-rx and --heartbeat-tx must be given together"),
        }
    }
}

/// How a participant announces itself.
pub struct Participant {
    pub role: Role,
    pub registry: Arc<dyn Registry>,
    pub heartbeat: Option<HeartbeatFds>,
    pub identity: Pid,
    pub discovery_backoff: Duration,
}

impl Participant {
    pub fn new(role: Role, registry: Arc<dyn Registry>, heartbeat: Option<HeartbeatFds>) -> Self {
        Self {
            role,
            registry,
            heartbeat,
            identity: Pid::current(),
            discovery_backoff: DISCOVERY_BACKOFF,
        }
    }

    pub fn with_identity(mut self, identity: Pid) -> Self {
        self.identity = identity;
        self
    }

    /// Runs `body` as this participant.
    pub async fn run<Ctx, F, T>(self, ctx: &Ctx, body: F) -> Result<T>
    where
        Ctx: GridContext + ?Sized,
        F: Future<Output = Result<T, CoreError>>,
    {
        let responder = match self.heartbeat {
            Some(fds) => {
                let rx = frame_reader(fds.rx.into_reader().context("adopting heartbeat rx")?);
                let tx = frame_writer(fds.tx.into_writer().context("adopting heartbeat tx")?);
                Some(tokio::spawn(respond_to_heartbeats(rx, tx)))
            }
            None => {
                warn!(role = %self.role, "Running without a heartbeat channel");
                None
            }
        };

        let membership = Membership::join(self.registry, self.role, self.identity, self.discovery_backoff, ctx)
            .await
            .with_context(|| format!("{} failed to join the registry", self.role))?;

        let outcome = body.await;

        if let Err(e) = membership.leave() {
            warn!(role = %self.role, "Could not withdraw: {}", e);
        }
        if let Some(handle) = responder {
            handle.abort();
        }
        match &outcome {
            Ok(_) => info!(role = %self.role, "Finished"),
            Err(e) => warn!(role = %self.role, "Finished with error: {}", e),
        }
        outcome.with_context(|| format!("{} failed", self.role))
    }
}
