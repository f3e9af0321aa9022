//! Potential-field drone dynamics.
//!
//! A point mass with viscous friction, driven by the commanded force from
//! the keyboard plus three fields:
//! - repulsion from every obstacle within `rho`
//! - repulsion from the four walls within `rho`
//! - attraction towards targets within `rho`
//!
//! Integration is the two-step finite difference of `M x'' + K x' = F`.

use dronegrid_core::link::send;
use dronegrid_core::{CoreError, ForceReport, FrameReader, FrameWriter, Message};
use dronegrid_env::Point;
use futures::StreamExt;
use nalgebra::Vector2;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Minimum distance at which a field still acts.
const MIN_FIELD_DISTANCE: f64 = 0.1;

/// Distance under which the drone is considered inside an obstacle.
const COLLISION_DISTANCE: f64 = 0.1;

/// Physics parameters.
#[derive(Debug, Clone)]
pub struct PhysicsConfig {
    /// Mass
    pub mass: f64,
    /// Viscous friction coefficient
    pub friction: f64,
    /// Integration step in simulated seconds
    pub dt: f64,
    /// Magnitude cap on the total force
    pub max_force: f64,
    /// Range of every field
    pub rho: f64,
    /// Field gain
    pub eta: f64,
    /// Force added per movement key
    pub key_force: f64,
    /// Wall-clock interval between integration steps
    pub step_interval: Duration,
    /// Wall-clock interval between position/force reports
    pub report_interval: Duration,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            mass: 1.0,
            friction: 10.0,
            dt: 0.01,
            max_force: 10.0,
            rho: 8.0,
            eta: 5.0,
            key_force: 1.0,
            step_interval: Duration::from_millis(1),
            report_interval: Duration::from_nanos(1_000_000_000 / 30),
        }
    }
}

/// Forces acting on the drone during one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceBreakdown {
    pub command: Vector2<f64>,
    pub obstacle: Vector2<f64>,
    pub wall: Vector2<f64>,
    pub target: Vector2<f64>,
}

impl Default for ForceBreakdown {
    fn default() -> Self {
        Self {
            command: Vector2::zeros(),
            obstacle: Vector2::zeros(),
            wall: Vector2::zeros(),
            target: Vector2::zeros(),
        }
    }
}

impl ForceBreakdown {
    /// Sum of all contributions, targets pulling towards themselves.
    pub fn total(&self) -> Vector2<f64> {
        self.command + self.obstacle + self.wall - self.target
    }

    pub fn report(&self) -> ForceReport {
        let pair = |v: Vector2<f64>| [v.x as f32, v.y as f32];
        ForceReport {
            drone: pair(self.command),
            obstacle: pair(self.obstacle),
            wall: pair(self.wall),
            target: pair(self.target),
        }
    }
}

/// What the caller should do after a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    None,
    /// Report this position immediately (first spawn)
    Report(Vector2<f64>),
    Exit,
}

/// The simulated drone and what it knows about the world.
#[derive(Debug, Clone)]
pub struct DronePhysics {
    config: PhysicsConfig,
    position: Vector2<f64>,
    previous: Vector2<f64>,
    command: Vector2<f64>,
    window: (i32, i32),
    obstacles: Vec<Point>,
    targets: Vec<Point>,
    spawned: bool,
    last_forces: ForceBreakdown,
}

impl DronePhysics {
    pub fn new(config: PhysicsConfig) -> Self {
        Self {
            config,
            position: Vector2::zeros(),
            previous: Vector2::zeros(),
            command: Vector2::zeros(),
            window: (0, 0),
            obstacles: Vec::new(),
            targets: Vec::new(),
            spawned: false,
            last_forces: ForceBreakdown::default(),
        }
    }

    pub fn position(&self) -> Vector2<f64> {
        self.position
    }

    pub fn command(&self) -> Vector2<f64> {
        self.command
    }

    pub fn is_spawned(&self) -> bool {
        self.spawned
    }

    pub fn last_forces(&self) -> ForceBreakdown {
        self.last_forces
    }

    /// Places the drone at rest.
    pub fn place(&mut self, position: Vector2<f64>) {
        self.position = position;
        self.previous = position;
        self.spawned = true;
    }

    /// Applies one message from the coordinator.
    pub fn apply(&mut self, message: Message) -> Reaction {
        match message {
            Message::Size { width, height } => {
                self.window = (width, height);
                if !self.spawned {
                    let centre = Vector2::new(width as f64 / 2.0, height as f64 / 2.0);
                    self.place(centre);
                    self.command = Vector2::zeros();
                    info!(x = centre.x, y = centre.y, "Drone spawned");
                    return Reaction::Report(centre);
                }
                Reaction::None
            }
            Message::Input('q') | Message::Exit => Reaction::Exit,
            Message::Input(key) => {
                self.press(key);
                Reaction::None
            }
            Message::Obstacles(points) => {
                debug!(count = points.len(), "Obstacles updated");
                self.obstacles = points;
                Reaction::None
            }
            Message::Targets(points) => {
                debug!(count = points.len(), "Targets updated");
                self.targets = points;
                Reaction::None
            }
            _ => Reaction::None,
        }
    }

    /// Adjusts the commanded force for a movement key.
    pub fn press(&mut self, key: char) {
        let f = self.config.key_force;
        let delta = match key {
            'e' => Vector2::new(0.0, -f),
            'r' => Vector2::new(f, -f),
            'f' => Vector2::new(f, 0.0),
            'v' => Vector2::new(f, f),
            'c' => Vector2::new(0.0, f),
            'x' => Vector2::new(-f, f),
            's' => Vector2::new(-f, 0.0),
            'w' => Vector2::new(-f, -f),
            'd' => {
                // Brake: halve, and snap small components to rest.
                self.command *= 0.5;
                for component in self.command.iter_mut() {
                    if component.abs() <= 0.5 {
                        *component = 0.0;
                    }
                }
                return;
            }
            _ => return,
        };
        self.command += delta;
    }

    /// Computes the field forces at the current position.
    pub fn forces(&self) -> ForceBreakdown {
        let c = &self.config;
        let field = |d: f64| c.eta * (1.0 / d - 1.0 / c.rho) / (d * d);

        let mut breakdown = ForceBreakdown {
            command: self.command,
            ..ForceBreakdown::default()
        };

        let cell_pull = |points: &[Point]| {
            let mut sum = Vector2::<f64>::zeros();
            for point in points {
                let offset = self.position - Vector2::new(point.x as f64 + 0.5, point.y as f64 + 0.5);
                let d = offset.norm() - 0.5;
                if d < c.rho && d > MIN_FIELD_DISTANCE {
                    sum += offset / d * field(d);
                }
            }
            sum
        };
        breakdown.obstacle = cell_pull(&self.obstacles);
        breakdown.target = cell_pull(&self.targets);

        let (width, height) = (self.window.0 as f64, self.window.1 as f64);
        let right = (width - 1.0) - self.position.x;
        let left = self.position.x - 1.0;
        let top = self.position.y - 1.0;
        let bottom = (height - 1.0) - self.position.y;
        let wall = |d: f64| if d < c.rho { field(d.max(MIN_FIELD_DISTANCE)) } else { 0.0 };
        breakdown.wall = Vector2::new(wall(left) - wall(right), wall(top) - wall(bottom));

        breakdown
    }

    /// Advances the drone by one integration step.
    pub fn step(&mut self) -> ForceBreakdown {
        let breakdown = self.forces();
        self.last_forces = breakdown;
        if !self.spawned {
            return breakdown;
        }

        let c = &self.config;
        let mut total = breakdown.total();
        let magnitude = total.norm();
        if magnitude > c.max_force {
            total *= c.max_force / magnitude;
        }

        let damping = c.friction * c.dt;
        let next = (total * (c.dt * c.dt) - self.previous * c.mass + self.position * (2.0 * c.mass + damping))
            / (c.mass + damping);
        let next = if next.iter().all(|v| v.is_finite()) { next } else { self.position };

        self.previous = self.position;
        self.position = next;

        let collided = self.obstacles.iter().any(|o| {
            (self.position - Vector2::new(o.x as f64, o.y as f64)).norm() <= COLLISION_DISTANCE
        });
        if collided {
            self.position = self.previous;
        }
        breakdown
    }

    /// POSITION and FORCE reports for the coordinator.
    pub fn reports(&self) -> [Message; 2] {
        [
            Message::Position {
                x: self.position.x as f32,
                y: self.position.y as f32,
            },
            Message::Force(self.last_forces.report()),
        ]
    }
}

// ============================================================================
// PROCESS LOOP
// ============================================================================

/// Runs the physics participant until EXIT, `q`, or the coordinator hangs up.
///
/// Returns the number of integration steps taken.
pub async fn run_physics(
    config: PhysicsConfig,
    mut rx: FrameReader,
    mut tx: FrameWriter,
) -> Result<u64, CoreError> {
    let mut step_timer = interval(config.step_interval);
    step_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report_timer = interval(config.report_interval);
    report_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut physics = DronePhysics::new(config);
    let mut steps = 0u64;

    loop {
        tokio::select! {
            next = rx.next() => {
                let frame = match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        info!("Coordinator closed the channel");
                        break;
                    }
                };
                let message = match frame.into_message() {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Dropping unreadable frame: {}", e);
                        continue;
                    }
                };
                match physics.apply(message) {
                    Reaction::Report(at) => {
                        send(&mut tx, Message::Position { x: at.x as f32, y: at.y as f32 }).await?;
                    }
                    Reaction::Exit => {
                        info!("Exit requested");
                        break;
                    }
                    Reaction::None => {}
                }
            }
            _ = step_timer.tick() => {
                if physics.is_spawned() {
                    physics.step();
                    steps += 1;
                }
            }
            _ = report_timer.tick() => {
                if physics.is_spawned() {
                    for message in physics.reports() {
                        send(&mut tx, message).await?;
                    }
                }
            }
        }
    }

    debug!(steps, "Physics loop finished");
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spawned(width: i32, height: i32) -> DronePhysics {
        let mut physics = DronePhysics::new(PhysicsConfig::default());
        physics.apply(Message::Size { width, height });
        physics
    }

    #[test]
    fn test_spawns_at_window_centre_once() {
        let mut physics = DronePhysics::new(PhysicsConfig::default());
        assert!(!physics.is_spawned());
        let reaction = physics.apply(Message::Size { width: 80, height: 24 });
        assert_eq!(reaction, Reaction::Report(Vector2::new(40.0, 12.0)));

        // A resize later does not respawn.
        assert_eq!(physics.apply(Message::Size { width: 100, height: 40 }), Reaction::None);
        assert_relative_eq!(physics.position().x, 40.0);
    }

    #[test]
    fn test_keys_accumulate_and_brake() {
        let mut physics = spawned(80, 24);
        physics.press('f');
        physics.press('f');
        physics.press('e');
        assert_relative_eq!(physics.command().x, 2.0);
        assert_relative_eq!(physics.command().y, -1.0);

        physics.press('d');
        assert_relative_eq!(physics.command().x, 1.0);
        assert_relative_eq!(physics.command().y, 0.0);
    }

    #[test]
    fn test_no_field_far_from_everything() {
        let physics = spawned(80, 24);
        let forces = physics.forces();
        assert_relative_eq!(forces.wall.norm(), 0.0);
        assert_relative_eq!(forces.obstacle.norm(), 0.0);
    }

    #[test]
    fn test_obstacle_pushes_away() {
        let mut physics = spawned(80, 24);
        // Obstacle cell centre is 3 units to the left of the drone.
        physics.apply(Message::Obstacles(vec![Point::new(36, 11)]));
        let forces = physics.forces();
        assert!(forces.obstacle.x > 0.0);
    }

    #[test]
    fn test_wall_pushes_inwards() {
        let mut physics = spawned(80, 24);
        physics.place(Vector2::new(3.0, 12.0));
        assert!(physics.forces().wall.x > 0.0);
        physics.place(Vector2::new(76.0, 12.0));
        assert!(physics.forces().wall.x < 0.0);
    }

    #[test]
    fn test_command_moves_drone_and_friction_limits_speed() {
        let mut physics = spawned(80, 24);
        physics.press('f');
        let start = physics.position().x;
        for _ in 0..100 {
            physics.step();
        }
        let moved = physics.position().x - start;
        assert!(moved > 0.0);
        // Terminal velocity F/K = 0.1 units per simulated second.
        assert!(moved < 0.1 * 100.0 * 0.01 + 1e-6);
    }

    #[test]
    fn test_total_force_is_capped() {
        let mut physics = spawned(80, 24);
        for _ in 0..50 {
            physics.press('f');
        }
        let before = physics.position();
        physics.step();
        let c = PhysicsConfig::default();
        // First step from rest: dx = F dt^2 / (M + K dt) with F capped.
        let expected = c.max_force * c.dt * c.dt / (c.mass + c.friction * c.dt);
        assert_relative_eq!(physics.position().x - before.x, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_exit_and_quit_key() {
        let mut physics = spawned(80, 24);
        assert_eq!(physics.apply(Message::Exit), Reaction::Exit);
        assert_eq!(physics.apply(Message::Input('q')), Reaction::Exit);
    }

    #[test]
    fn test_reports_carry_position_and_forces() {
        let mut physics = spawned(80, 24);
        physics.press('c');
        physics.step();
        match &physics.reports() {
            [Message::Position { x, y }, Message::Force(report)] => {
                assert_relative_eq!(*x, 40.0, epsilon = 1e-3);
                assert!(*y >= 12.0);
                assert_relative_eq!(report.drone[1], 1.0);
            }
            other => panic!("unexpected reports {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_spawns_reports_and_exits() {
        use dronegrid_core::{frame_reader, frame_writer};
        use futures::SinkExt;

        let (coord_out, phys_in) = tokio::io::duplex(1 << 16);
        let (phys_out, coord_in) = tokio::io::duplex(1 << 16);
        let mut to_physics = frame_writer(coord_out);
        let mut from_physics = frame_reader(coord_in);
        let handle = tokio::spawn(run_physics(
            PhysicsConfig::default(),
            frame_reader(phys_in),
            frame_writer(phys_out),
        ));

        to_physics.send(Message::Size { width: 80, height: 24 }).await.unwrap();
        let first = from_physics.next().await.unwrap().unwrap().into_message().unwrap();
        assert_eq!(first, Message::Position { x: 40.0, y: 12.0 });

        // Periodic reports follow as POSITION then FORCE.
        let mut saw_force = false;
        for _ in 0..4 {
            let message = from_physics.next().await.unwrap().unwrap().into_message().unwrap();
            saw_force |= matches!(message, Message::Force(_));
        }
        assert!(saw_force);

        to_physics.send(Message::Exit).await.unwrap();
        let steps = handle.await.unwrap().unwrap();
        assert!(steps > 0);
    }
}
