//! Heartbeat Failure Detector (the supervisor's monitoring loop).
//!
//! Each cycle re-reads the registry and probes every participant in turn,
//! one at a time, each with its own hard timeout. The first participant that
//! is still registered but does not answer takes the whole group down.
//! There are no retries and no partial restarts.
//!
//! ```text
//!   warm-up ──► refresh ──► probe p1 ──► probe p2 ──► ... ──► sleep(cycle_delay) ─┐
//!                  ▲            │ miss                                             │
//!                  │            ▼                                                  │
//!                  │     still registered? ──yes──► group kill, stop               │
//!                  │            │ no (withdrew)                                    │
//!                  │            ▼                                                  │
//!                  │        skip it                                                │
//!                  └───────────────────────────────────────────────────────────────┘
//! ```

use crate::error::CoreError;
use crate::heartbeat::{LivenessProbe, ProbeOutcome};

use dronegrid_env::{GridContext, GroupKill, Pid, Registry, RegistryEntry, Role};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the failure detector.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Default wait for each participant's answer
    pub probe_timeout: Duration,

    /// Per-role overrides of `probe_timeout`
    pub role_timeouts: HashMap<Role, Duration>,

    /// Pause between two full passes
    pub cycle_delay: Duration,

    /// Pause when nobody is registered yet
    pub idle_delay: Duration,

    /// Pause after the supervisor publishes itself, before the first pass
    pub warmup: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(200),
            role_timeouts: HashMap::new(),
            cycle_delay: Duration::from_secs(2),
            idle_delay: Duration::from_secs(1),
            warmup: Duration::from_secs(1),
        }
    }
}

impl DetectorConfig {
    pub fn timeout_for(&self, role: Role) -> Duration {
        self.role_timeouts
            .get(&role)
            .copied()
            .unwrap_or(self.probe_timeout)
    }
}

/// What the detector knows about one monitored participant.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantRecord {
    pub role: Role,
    pub identity: Pid,
    /// Context time of the last acknowledged probe
    pub last_heartbeat_at: Option<Duration>,
    pub timeout: Duration,
}

/// Result of one monitoring pass.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleReport {
    /// Nobody to monitor
    Idle,
    /// Every probed participant answered
    Healthy { probed: usize, skipped: usize },
    /// A registered participant failed its probe
    Failed {
        role: Role,
        identity: Pid,
        outcome: ProbeOutcome,
    },
}

/// Why the detector stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorOutcome {
    /// Shutdown was requested (the coordinator quit)
    Shutdown { cycles: u64 },
    /// A participant failed and the group kill was issued
    GroupKilled {
        role: Role,
        identity: Pid,
        outcome: ProbeOutcome,
        cycles: u64,
    },
}

/// The supervisor's monitoring loop.
pub struct HeartbeatDetector<Ctx: GridContext, P: LivenessProbe> {
    ctx: Arc<Ctx>,
    registry: Arc<dyn Registry>,
    probe: P,
    killer: Arc<dyn GroupKill>,
    config: DetectorConfig,
    identity: Pid,
    records: BTreeMap<Role, ParticipantRecord>,
    cycles: u64,
}

impl<Ctx: GridContext, P: LivenessProbe> HeartbeatDetector<Ctx, P> {
    pub fn new(
        ctx: Arc<Ctx>,
        registry: Arc<dyn Registry>,
        probe: P,
        killer: Arc<dyn GroupKill>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            ctx,
            registry,
            probe,
            killer,
            config,
            identity: Pid::current(),
            records: BTreeMap::new(),
            cycles: 0,
        }
    }

    /// Overrides the identity the supervisor publishes (tests).
    pub fn with_identity(mut self, identity: Pid) -> Self {
        self.identity = identity;
        self
    }

    pub fn records(&self) -> &BTreeMap<Role, ParticipantRecord> {
        &self.records
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Publishes the supervisor, then monitors until shutdown or a failure.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<DetectorOutcome, CoreError> {
        self.registry.publish(Role::Supervisor, self.identity)?;
        info!(pid = %self.identity, warmup_ms = self.config.warmup.as_millis() as u64, "Supervisor published");

        if pause(self.ctx.as_ref(), self.config.warmup, &shutdown).await {
            return Ok(self.shutdown_outcome());
        }

        loop {
            if shutdown.is_cancelled() {
                return Ok(self.shutdown_outcome());
            }

            let delay = match self.cycle().await? {
                CycleReport::Idle => {
                    debug!("No participants registered; idling");
                    self.config.idle_delay
                }
                CycleReport::Healthy { probed, skipped } => {
                    info!(cycle = self.cycles, probed, skipped, "All processes responsive");
                    self.config.cycle_delay
                }
                CycleReport::Failed {
                    role,
                    identity,
                    outcome,
                } => {
                    self.kill_group()?;
                    return Ok(DetectorOutcome::GroupKilled {
                        role,
                        identity,
                        outcome,
                        cycles: self.cycles,
                    });
                }
            };

            if pause(self.ctx.as_ref(), delay, &shutdown).await {
                return Ok(self.shutdown_outcome());
            }
        }
    }

    /// Runs one monitoring pass without sleeping or killing.
    pub async fn cycle(&mut self) -> Result<CycleReport, CoreError> {
        self.cycles += 1;
        let members = self.membership();
        if members.is_empty() {
            self.records.clear();
            return Ok(CycleReport::Idle);
        }

        self.records
            .retain(|role, record| members.iter().any(|m| m.role == *role && m.pid == record.identity));

        let mut probed = 0;
        let mut skipped = 0;
        for member in members {
            let timeout = self.config.timeout_for(member.role);
            let outcome = self.probe.probe(member.role, timeout).await;

            if let ProbeOutcome::Acknowledged(rtt) = outcome {
                probed += 1;
                let now = self.ctx.now();
                self.records
                    .entry(member.role)
                    .and_modify(|record| record.last_heartbeat_at = Some(now))
                    .or_insert(ParticipantRecord {
                        role: member.role,
                        identity: member.pid,
                        last_heartbeat_at: Some(now),
                        timeout,
                    });
                debug!(role = %member.role, pid = %member.pid, rtt_us = rtt.as_micros() as u64, "Heartbeat acknowledged");
                continue;
            }

            // A clean exit withdraws before closing its channels.
            if !self.still_registered(&member) {
                info!(role = %member.role, pid = %member.pid, ?outcome, "Participant withdrew; not a failure");
                self.records.remove(&member.role);
                skipped += 1;
                continue;
            }

            error!(
                role = %member.role,
                pid = %member.pid,
                timeout_ms = timeout.as_millis() as u64,
                ?outcome,
                "Participant failed liveness probe"
            );
            return Ok(CycleReport::Failed {
                role: member.role,
                identity: member.pid,
                outcome,
            });
        }

        Ok(CycleReport::Healthy { probed, skipped })
    }

    /// Registered participants other than supervisors, first entry per role.
    fn membership(&self) -> Vec<RegistryEntry> {
        let entries = match self.registry.refresh() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Registry unreadable, treating as empty: {}", e);
                Vec::new()
            }
        };
        let mut members: Vec<RegistryEntry> = Vec::new();
        for entry in entries {
            if entry.role == Role::Supervisor || entry.pid == self.identity {
                continue;
            }
            if members.iter().any(|m| m.role == entry.role) {
                continue;
            }
            members.push(entry);
        }
        members
    }

    fn still_registered(&self, member: &RegistryEntry) -> bool {
        match self.registry.refresh() {
            Ok(entries) => entries.contains(member),
            // Unreadable now but readable a moment ago: assume still there.
            Err(_) => true,
        }
    }

    fn kill_group(&self) -> Result<(), CoreError> {
        let members = self.registry.refresh().unwrap_or_default();
        error!(members = members.len(), "Terminating all participants");
        self.killer.kill_group(&members)?;
        Ok(())
    }

    fn shutdown_outcome(&self) -> DetectorOutcome {
        info!(cycles = self.cycles, "Supervisor shutting down");
        if let Err(e) = self.registry.withdraw(Role::Supervisor, self.identity) {
            warn!("Could not withdraw supervisor: {}", e);
        }
        DetectorOutcome::Shutdown { cycles: self.cycles }
    }
}

/// Sleeps for `duration`; returns `true` if shutdown arrived first.
async fn pause<Ctx: GridContext>(ctx: &Ctx, duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = ctx.sleep(duration) => false,
    }
}
