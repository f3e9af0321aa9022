//! Central Coordinator event loop.
//!
//! The coordinator is a single-threaded reactor and the only owner of the
//! [`WorldState`]. Each iteration:
//!
//! 1. drains local UI events (quit, resize, movement keys)
//! 2. checks the obstacle relocation timer
//! 3. waits, bounded by `readiness_wait`, for any inbound channel
//! 4. applies every ready frame and fans the result out to dependents
//!
//! Because one task applies every frame, dependents only ever receive copies
//! of complete states.

use crate::error::{CoreError, FrameError};
use crate::link::{forward, FrameReader, FrameWriter};
use crate::protocol::{ForceReport, Frame, Message};
use crate::render::{Renderer, UiEvent, UiSource};
use crate::world::{TargetContact, WorldState};

use dronegrid_env::{GridContext, Point, Role};
use futures::stream::{self, BoxStream, SelectAll};
use futures::{FutureExt, StreamExt};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// RNG stream reserved for the coordinator.
pub const COORDINATOR_RNG_STREAM: u64 = 1;

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bounded wait for inbound readiness per iteration
    pub readiness_wait: Duration,

    /// Interval between single-obstacle relocations
    pub obstacle_period: Duration,

    /// Window size announced at startup
    pub window: (i32, i32),
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            readiness_wait: Duration::from_millis(30),
            obstacle_period: Duration::from_secs(5),
            window: (80, 24),
        }
    }
}

/// Diagnostic UI state, logged at trace level on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ProcessingInput,
    UpdatingMap,
    Rendering,
    Broadcasting,
}

/// Whether the loop keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Totals reported when the loop ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorSummary {
    pub iterations: u64,
    pub frames_applied: u64,
    pub targets_reached: u32,
}

/// Channel endpoints handed to the coordinator.
#[derive(Default)]
pub struct CoordinatorLinks {
    inbound: Vec<(Role, FrameReader)>,
    outbound: Vec<(Role, FrameWriter)>,
    supervisor: Option<FrameWriter>,
}

impl CoordinatorLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dependent that both sends to and receives from the coordinator.
    pub fn dependent(self, role: Role, from: FrameReader, to: FrameWriter) -> Self {
        self.inbound(role, from).outbound(role, to)
    }

    pub fn inbound(mut self, role: Role, from: FrameReader) -> Self {
        self.inbound.push((role, from));
        self
    }

    pub fn outbound(mut self, role: Role, to: FrameWriter) -> Self {
        self.outbound.push((role, to));
        self
    }

    /// Channel used to tell the supervisor the run is over.
    pub fn supervisor(mut self, to: FrameWriter) -> Self {
        self.supervisor = Some(to);
        self
    }
}

/// One event from the inbound multiplex set.
enum Inbound {
    Frame(Role, Result<Frame, FrameError>),
    Closed(Role),
}

fn inbound_stream(role: Role, reader: FrameReader) -> BoxStream<'static, Inbound> {
    reader
        .map(move |item| Inbound::Frame(role, item))
        .chain(stream::once(async move { Inbound::Closed(role) }))
        .boxed()
}

/// The coordinator.
pub struct Coordinator<Ctx: GridContext> {
    ctx: Arc<Ctx>,
    config: CoordinatorConfig,
    world: WorldState,
    inbound: SelectAll<BoxStream<'static, Inbound>>,
    outbound: BTreeMap<Role, FrameWriter>,
    supervisor: Option<FrameWriter>,
    renderer: Box<dyn Renderer>,
    ui: Box<dyn UiSource>,
    rng: ChaCha8Rng,
    phase: Phase,
    last_status: String,
    last_relocation: Duration,
    iterations: u64,
    frames_applied: u64,
    shutting_down: bool,
}

impl<Ctx: GridContext> Coordinator<Ctx> {
    pub fn new(
        ctx: Arc<Ctx>,
        config: CoordinatorConfig,
        links: CoordinatorLinks,
        renderer: Box<dyn Renderer>,
        ui: Box<dyn UiSource>,
    ) -> Self {
        let inbound = stream::select_all(
            links
                .inbound
                .into_iter()
                .map(|(role, reader)| inbound_stream(role, reader)),
        );
        let rng = ctx.derive_rng(COORDINATOR_RNG_STREAM);
        let last_relocation = ctx.now();
        let world = WorldState {
            window: config.window,
            ..WorldState::default()
        };

        Self {
            ctx,
            config,
            world,
            inbound,
            outbound: links.outbound.into_iter().collect(),
            supervisor: links.supervisor,
            renderer,
            ui,
            rng,
            phase: Phase::Idle,
            last_status: String::new(),
            last_relocation,
            iterations: 0,
            frames_applied: 0,
            shutting_down: false,
        }
    }

    pub fn world(&self) -> &WorldState {
        &self.world
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of inbound channels still open.
    pub fn open_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Dependents that can still be written to.
    pub fn outbound_roles(&self) -> Vec<Role> {
        self.outbound.keys().copied().collect()
    }

    pub fn summary(&self) -> CoordinatorSummary {
        CoordinatorSummary {
            iterations: self.iterations,
            frames_applied: self.frames_applied,
            targets_reached: self.world.targets_reached,
        }
    }

    /// Draws the empty world and announces the window size to every dependent.
    pub async fn start(&mut self) -> Result<(), CoreError> {
        info!(
            width = self.world.window.0,
            height = self.world.window.1,
            inbound = self.inbound.len(),
            outbound = self.outbound.len(),
            "Coordinator starting"
        );
        self.render()?;
        let (width, height) = self.world.window;
        self.broadcast_all(None, &Message::Size { width, height }).await;
        Ok(())
    }

    /// Runs until quit, then restores the renderer.
    pub async fn run(&mut self) -> Result<CoordinatorSummary, CoreError> {
        self.start().await?;
        loop {
            match self.step().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(e) => {
                    error!("Coordinator loop failed: {}", e);
                    if let Err(restore) = self.renderer.shutdown() {
                        warn!("Renderer shutdown failed: {}", restore);
                    }
                    return Err(e);
                }
            }
        }
        self.renderer.shutdown()?;
        let summary = self.summary();
        info!(
            iterations = summary.iterations,
            frames = summary.frames_applied,
            reached = summary.targets_reached,
            "Coordinator stopped"
        );
        Ok(summary)
    }

    /// One loop iteration.
    pub async fn step(&mut self) -> Result<Flow, CoreError> {
        self.iterations += 1;
        self.set_phase(Phase::Idle);

        while let Some(event) = self.ui.poll_event()? {
            if self.handle_ui(event).await? == Flow::Quit {
                return Ok(Flow::Quit);
            }
        }

        self.tick_obstacle_timer().await?;

        if self.inbound.is_empty() {
            self.ctx.sleep(self.config.readiness_wait).await;
            return Ok(Flow::Continue);
        }

        let first = tokio::select! {
            event = self.inbound.next() => event,
            _ = self.ctx.sleep(self.config.readiness_wait) => None,
        };
        let Some(first) = first else {
            return Ok(Flow::Continue);
        };
        if self.dispatch(first).await? == Flow::Quit {
            return Ok(Flow::Quit);
        }

        // Whatever else is already buffered, about one frame per channel.
        for _ in 1..self.inbound.len() {
            let Some(Some(event)) = self.inbound.next().now_or_never() else {
                break;
            };
            if self.dispatch(event).await? == Flow::Quit {
                return Ok(Flow::Quit);
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_ui(&mut self, event: UiEvent) -> Result<Flow, CoreError> {
        self.set_phase(Phase::ProcessingInput);
        match event {
            UiEvent::Quit | UiEvent::Key('q') => self.quit().await,
            UiEvent::Key(key) => {
                trace!(%key, "Forwarding input");
                self.deliver(Role::Physics, &Message::Input(key).to_frame()).await;
                Ok(Flow::Continue)
            }
            UiEvent::Resize { width, height } => {
                self.on_size(None, width, height).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn dispatch(&mut self, event: Inbound) -> Result<Flow, CoreError> {
        match event {
            Inbound::Closed(role) => {
                if self.shutting_down {
                    debug!(%role, "Dependent closed its channel");
                } else {
                    warn!(%role, "Dependent closed its channel; removed from multiplex set");
                }
                Ok(Flow::Continue)
            }
            Inbound::Frame(role, Err(e)) => {
                // The stream ends after a framing error; Closed follows.
                error!(%role, "Channel unusable: {}", e);
                Ok(Flow::Continue)
            }
            Inbound::Frame(role, Ok(frame)) => match frame.into_message() {
                Ok(message) => {
                    self.frames_applied += 1;
                    self.apply(role, message).await
                }
                Err(e) => {
                    warn!(%role, "Dropping frame: {}", e);
                    Ok(Flow::Continue)
                }
            },
        }
    }

    /// Applies one parsed message from `from`.
    pub async fn apply(&mut self, from: Role, message: Message) -> Result<Flow, CoreError> {
        match message {
            Message::Position { x, y } if from == Role::Relay => self.on_remote_position(x, y).await?,
            Message::Position { x, y } => self.on_position(x, y).await?,
            Message::Force(report) => self.on_force(report)?,
            Message::Obstacles(points) => self.on_obstacles(from, points).await?,
            Message::Targets(points) => self.on_targets(from, points).await?,
            Message::Size { width, height } => self.on_size(Some(from), width, height).await?,
            Message::Exit if from == Role::Relay => {
                info!("Peer instance requested exit");
                return self.quit().await;
            }
            other => debug!(%from, kind = %other.kind(), "Ignoring frame"),
        }
        Ok(Flow::Continue)
    }

    async fn on_position(&mut self, x: f32, y: f32) -> Result<(), CoreError> {
        self.set_phase(Phase::UpdatingMap);
        self.world.drone = (x, y);
        self.render()?;
        self.deliver(Role::Relay, &Message::Position { x, y }.to_frame()).await;

        let Some(contact) = self.world.resolve_target_contact(&mut self.rng) else {
            return Ok(());
        };
        match contact {
            TargetContact::Expected { cleared, remaining } => {
                info!(%cleared, remaining, reached = self.world.targets_reached, "Target reached");
            }
            TargetContact::Unexpected { index, from, to: Some(to) } => {
                info!(index, %from, %to, "Out-of-order target reached; relocated");
            }
            TargetContact::Unexpected { index, from, to: None } => {
                warn!(index, %from, "Out-of-order target reached but could not be moved");
                return Ok(());
            }
        }

        self.render()?;
        let targets = Message::Targets(self.world.targets.clone());
        self.broadcast(&[Role::Physics, Role::ObstacleGenerator], &targets).await;

        if self.world.targets.is_empty() {
            info!(reached = self.world.targets_reached, "All targets cleared; requesting a new set");
            let obstacles = Message::Obstacles(self.world.obstacles.clone());
            self.deliver(Role::TargetGenerator, &obstacles.to_frame()).await;
        }
        Ok(())
    }

    async fn on_remote_position(&mut self, x: f32, y: f32) -> Result<(), CoreError> {
        self.set_phase(Phase::UpdatingMap);
        self.world.remote_drone = Some((x, y));
        self.render()?;
        let obstacle = Message::Obstacles(vec![Point::from_position(x, y)]);
        self.deliver(Role::Physics, &obstacle.to_frame()).await;
        Ok(())
    }

    fn on_force(&mut self, report: ForceReport) -> Result<(), CoreError> {
        self.world.forces = report;
        let line = self.world.status_line();
        if line != self.last_status {
            self.set_phase(Phase::Rendering);
            self.renderer.status(&line)?;
            self.last_status = line;
        }
        Ok(())
    }

    async fn on_obstacles(&mut self, from: Role, points: Vec<Point>) -> Result<(), CoreError> {
        self.set_phase(Phase::UpdatingMap);
        info!(%from, count = points.len(), "Obstacles received");
        self.world.obstacles = points;
        self.render()?;
        let message = Message::Obstacles(self.world.obstacles.clone());
        let roles = without(&[Role::Physics, Role::TargetGenerator], from);
        self.broadcast(&roles, &message).await;
        Ok(())
    }

    async fn on_targets(&mut self, from: Role, points: Vec<Point>) -> Result<(), CoreError> {
        self.set_phase(Phase::UpdatingMap);
        info!(%from, count = points.len(), "Targets received");
        self.world.targets = points;
        self.render()?;
        let message = Message::Targets(self.world.targets.clone());
        let roles = without(&[Role::Physics, Role::ObstacleGenerator], from);
        self.broadcast(&roles, &message).await;
        Ok(())
    }

    async fn on_size(&mut self, from: Option<Role>, width: i32, height: i32) -> Result<(), CoreError> {
        self.set_phase(Phase::UpdatingMap);
        info!(width, height, "Window size changed");
        self.world.window = (width, height);
        self.render()?;
        self.broadcast_all(from, &Message::Size { width, height }).await;
        Ok(())
    }

    async fn tick_obstacle_timer(&mut self) -> Result<(), CoreError> {
        let now = self.ctx.now();
        if now.saturating_sub(self.last_relocation) < self.config.obstacle_period {
            return Ok(());
        }
        self.last_relocation = now;
        if self.world.obstacles.is_empty() {
            return Ok(());
        }

        self.set_phase(Phase::UpdatingMap);
        let index = self.rng.gen_range(0..self.world.obstacles.len());
        if let Some(cell) = self.world.relocate_obstacle(index, &mut self.rng) {
            debug!(index, %cell, "Obstacle relocated");
            self.render()?;
            let message = Message::Obstacles(self.world.obstacles.clone());
            self.broadcast(&[Role::Physics], &message).await;
        }
        Ok(())
    }

    async fn quit(&mut self) -> Result<Flow, CoreError> {
        self.shutting_down = true;
        info!("Quit requested; notifying dependents");
        self.broadcast_all(None, &Message::Exit).await;
        if let Some(mut supervisor) = self.supervisor.take() {
            if let Err(e) = forward(&mut supervisor, &Message::Exit.to_frame()).await {
                warn!("Supervisor unreachable: {}", e);
            }
        }
        Ok(Flow::Quit)
    }

    fn render(&mut self) -> Result<(), CoreError> {
        self.set_phase(Phase::Rendering);
        self.renderer.render(&self.world)
    }

    /// Sends to every connected dependent except `except`.
    async fn broadcast_all(&mut self, except: Option<Role>, message: &Message) {
        let roles: Vec<Role> = self
            .outbound
            .keys()
            .copied()
            .filter(|role| Some(*role) != except)
            .collect();
        self.broadcast(&roles, message).await;
    }

    async fn broadcast(&mut self, roles: &[Role], message: &Message) {
        self.set_phase(Phase::Broadcasting);
        let frame = message.to_frame();
        for role in roles {
            self.deliver(*role, &frame).await;
        }
    }

    /// Writes one frame to `role`, dropping the link if it is broken.
    async fn deliver(&mut self, role: Role, frame: &Frame) {
        let Some(writer) = self.outbound.get_mut(&role) else {
            trace!(%role, "No link to dependent; frame not sent");
            return;
        };
        if let Err(e) = forward(writer, frame).await {
            if self.shutting_down {
                debug!(%role, "Dependent gone during shutdown: {}", e);
            } else {
                warn!(%role, "Dependent unreachable; dropping link: {}", e);
            }
            self.outbound.remove(&role);
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!(from = ?self.phase, to = ?phase, "Phase");
            self.phase = phase;
        }
    }
}

fn without(roles: &[Role], excluded: Role) -> Vec<Role> {
    roles.iter().copied().filter(|role| *role != excluded).collect()
}
