//! Authoritative world state, owned by the coordinator.
//!
//! Nothing outside the coordinator holds a reference to a [`WorldState`];
//! every other process sees copies delivered as frames.

use crate::protocol::ForceReport;

use dronegrid_env::Point;
use rand::Rng;
use serde::Serialize;
use tracing::warn;

/// Upper bound on random draws when looking for a free cell.
pub const MAX_PLACEMENT_ATTEMPTS: usize = 1024;

/// Draws a random interior cell of a `width` x `height` window.
///
/// Interior means the border rows and columns are excluded. Returns `None`
/// when the window has no interior.
pub fn random_cell<R: Rng>(rng: &mut R, window: (i32, i32)) -> Option<Point> {
    let (width, height) = window;
    if width < 3 || height < 3 {
        return None;
    }
    Some(Point::new(rng.gen_range(1..width - 1), rng.gen_range(1..height - 1)))
}

/// Draws interior cells until one is not `occupied`.
pub fn free_cell<R, F>(rng: &mut R, window: (i32, i32), occupied: F) -> Option<Point>
where
    R: Rng,
    F: Fn(Point) -> bool,
{
    (0..MAX_PLACEMENT_ATTEMPTS)
        .filter_map(|_| random_cell(rng, window))
        .find(|cell| !occupied(*cell))
}

/// Outcome of the drone touching a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetContact {
    /// The head of the sequence was reached and removed
    Expected { cleared: Point, remaining: usize },
    /// A later target was reached and moved elsewhere (`to` is `None` when no
    /// free cell was found and it stayed put)
    Unexpected { index: usize, from: Point, to: Option<Point> },
}

/// The coordinator's view of the simulation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorldState {
    /// Drone position in grid units
    pub drone: (f32, f32),
    /// Obstacle cells
    pub obstacles: Vec<Point>,
    /// Target cells, in the order they must be reached
    pub targets: Vec<Point>,
    /// Playable window size
    pub window: (i32, i32),
    /// Targets reached in order so far
    pub targets_reached: u32,
    /// Last force breakdown from physics
    pub forces: ForceReport,
    /// Position of the peer instance's drone, when a relay is attached
    pub remote_drone: Option<(f32, f32)>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cell currently occupied by the drone.
    pub fn drone_cell(&self) -> Point {
        Point::from_position(self.drone.0, self.drone.1)
    }

    /// Resolves a drone/target contact at the drone's current cell.
    ///
    /// Only the first matching target is handled. Reaching index 0 removes it
    /// and advances the counter; reaching any other index moves that target
    /// to a free cell and keeps the count unchanged.
    pub fn resolve_target_contact<R: Rng>(&mut self, rng: &mut R) -> Option<TargetContact> {
        let cell = self.drone_cell();
        let index = self.targets.iter().position(|target| *target == cell)?;

        if index == 0 {
            let cleared = self.targets.remove(0);
            self.targets_reached += 1;
            return Some(TargetContact::Expected {
                cleared,
                remaining: self.targets.len(),
            });
        }

        let from = self.targets[index];
        let to = self.relocate_target(index, rng);
        Some(TargetContact::Unexpected { index, from, to })
    }

    /// Moves target `index` to a cell free of obstacles, other targets and
    /// the drone.
    pub fn relocate_target<R: Rng>(&mut self, index: usize, rng: &mut R) -> Option<Point> {
        let drone = self.drone_cell();
        let spot = free_cell(rng, self.window, |cell| {
            cell == drone
                || self.obstacles.contains(&cell)
                || self
                    .targets
                    .iter()
                    .enumerate()
                    .any(|(i, target)| i != index && *target == cell)
        });
        match spot {
            Some(cell) => {
                self.targets[index] = cell;
                Some(cell)
            }
            None => {
                warn!(index, "No free cell for target; left in place");
                None
            }
        }
    }

    /// Moves obstacle `index` to a cell free of other obstacles and targets.
    pub fn relocate_obstacle<R: Rng>(&mut self, index: usize, rng: &mut R) -> Option<Point> {
        let spot = free_cell(rng, self.window, |cell| {
            self.targets.contains(&cell)
                || self
                    .obstacles
                    .iter()
                    .enumerate()
                    .any(|(i, obstacle)| i != index && *obstacle == cell)
        });
        match spot {
            Some(cell) => {
                self.obstacles[index] = cell;
                Some(cell)
            }
            None => {
                warn!(index, "No free cell for obstacle; left in place");
                None
            }
        }
    }

    /// Diagnostic status line, `x=.. y=.. | drn(..) | obst(..) | wall(..) | targ(..)`.
    pub fn status_line(&self) -> String {
        let f = &self.forces;
        format!(
            "x={:.4} y={:.4} | drn({:.4} {:.4}) | obst({:.4} {:.4}) | wall({:.4} {:.4}) | targ({:.4} {:.4})",
            self.drone.0,
            self.drone.1,
            f.drone[0],
            f.drone[1],
            f.obstacle[0],
            f.obstacle[1],
            f.wall[0],
            f.wall[1],
            f.target[0],
            f.target[1]
        )
    }
}
