//! Obstacle and target generators.
//!
//! Both are reactive: they hold the latest window size and the other
//! generator's points, and regenerate their own set when the coordinator
//! tells them something changed.

use dronegrid_core::link::send;
use dronegrid_core::world::free_cell;
use dronegrid_core::{CoreError, FrameReader, FrameWriter, Message};
use dronegrid_env::Point;
use futures::StreamExt;
use rand::Rng;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Density parameters for both generators.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Obstacles per interior cell
    pub obstacle_density: f64,
    /// Targets per interior cell
    pub target_density: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            obstacle_density: 0.005,
            target_density: 0.001,
        }
    }
}

/// Number of entities for a window, never fewer than one.
pub fn population(window: (i32, i32), density: f64) -> usize {
    let interior = ((window.0 - 2).max(0) as f64) * ((window.1 - 2).max(0) as f64);
    ((interior * density).round() as usize).max(1)
}

/// Draws up to `count` distinct free cells.
fn scatter<R: Rng>(rng: &mut R, window: (i32, i32), count: usize, avoid: &[Point]) -> Vec<Point> {
    let mut taken: HashSet<Point> = avoid.iter().copied().collect();
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        match free_cell(rng, window, |cell| taken.contains(&cell)) {
            Some(cell) => {
                taken.insert(cell);
                points.push(cell);
            }
            None => {
                warn!(placed = points.len(), wanted = count, "Ran out of free cells");
                break;
            }
        }
    }
    points
}

/// Generates obstacles on every SIZE.
#[derive(Debug)]
pub struct ObstacleGenerator<R: Rng> {
    density: f64,
    rng: R,
    targets: Vec<Point>,
    obstacles: Vec<Point>,
}

impl<R: Rng> ObstacleGenerator<R> {
    pub fn new(config: &GeneratorConfig, rng: R) -> Self {
        Self {
            density: config.obstacle_density,
            rng,
            targets: Vec::new(),
            obstacles: Vec::new(),
        }
    }

    pub fn obstacles(&self) -> &[Point] {
        &self.obstacles
    }

    /// Returns the reply to send, if any, or `None` on exit.
    pub fn handle(&mut self, message: Message) -> Option<Option<Message>> {
        match message {
            Message::Size { width, height } => {
                let count = population((width, height), self.density);
                self.obstacles = scatter(&mut self.rng, (width, height), count, &self.targets);
                info!(count = self.obstacles.len(), width, height, "Generated obstacles");
                Some(Some(Message::Obstacles(self.obstacles.clone())))
            }
            Message::Targets(points) => {
                debug!(count = points.len(), "Targets noted");
                self.targets = points;
                Some(None)
            }
            Message::Exit => None,
            _ => Some(None),
        }
    }
}

/// Generates targets whenever a new obstacle set arrives.
#[derive(Debug)]
pub struct TargetGenerator<R: Rng> {
    density: f64,
    rng: R,
    window: Option<(i32, i32)>,
    obstacles: Vec<Point>,
    targets: Vec<Point>,
}

impl<R: Rng> TargetGenerator<R> {
    pub fn new(config: &GeneratorConfig, rng: R) -> Self {
        Self {
            density: config.target_density,
            rng,
            window: None,
            obstacles: Vec::new(),
            targets: Vec::new(),
        }
    }

    pub fn targets(&self) -> &[Point] {
        &self.targets
    }

    /// Returns the reply to send, if any, or `None` on exit.
    pub fn handle(&mut self, message: Message) -> Option<Option<Message>> {
        match message {
            Message::Size { width, height } => {
                self.window = Some((width, height));
                Some(None)
            }
            Message::Obstacles(points) => {
                self.obstacles = points;
                let Some(window) = self.window else {
                    debug!("Obstacles before window size, holding");
                    return Some(None);
                };
                let count = population(window, self.density);
                self.targets = scatter(&mut self.rng, window, count, &self.obstacles);
                info!(count = self.targets.len(), "Generated targets");
                Some(Some(Message::Targets(self.targets.clone())))
            }
            Message::Exit => None,
            _ => Some(None),
        }
    }
}

/// Drives a generator's handler over its channel pair.
pub async fn run_generator<H>(mut handler: H, mut rx: FrameReader, mut tx: FrameWriter) -> Result<(), CoreError>
where
    H: FnMut(Message) -> Option<Option<Message>>,
{
    while let Some(next) = rx.next().await {
        let message = match next?.into_message() {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unreadable frame: {}", e);
                continue;
            }
        };
        match handler(message) {
            Some(Some(reply)) => send(&mut tx, reply).await?,
            Some(None) => {}
            None => {
                info!("Exit requested");
                return Ok(());
            }
        }
    }
    info!("Coordinator closed the channel");
    Ok(())
}
