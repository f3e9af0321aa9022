//! Rendering and local input seams of the coordinator.
//!
//! The coordinator owns the terminal; these traits keep the event loop
//! independent of how (or whether) anything is drawn.

use crate::error::CoreError;
use crate::world::WorldState;

use tokio::sync::mpsc;
use tracing::{debug, info};

/// Local UI events, polled without blocking once per loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    /// A key press
    Key(char),
    /// The playable window changed size
    Resize { width: i32, height: i32 },
    /// Quit requested outside the keyboard (e.g. Ctrl-C)
    Quit,
}

/// Source of local UI events.
pub trait UiSource: Send {
    /// Returns the next pending event, or `None` without waiting.
    fn poll_event(&mut self) -> Result<Option<UiEvent>, CoreError>;
}

/// Draws the world and the status line.
pub trait Renderer: Send {
    fn render(&mut self, world: &WorldState) -> Result<(), CoreError>;

    fn status(&mut self, line: &str) -> Result<(), CoreError>;

    /// Restores whatever the renderer took over.
    fn shutdown(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Renderer that draws nothing.
#[derive(Debug, Default)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn render(&mut self, _world: &WorldState) -> Result<(), CoreError> {
        Ok(())
    }

    fn status(&mut self, _line: &str) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Renderer for headless runs: frames go to the log.
#[derive(Debug, Default)]
pub struct TraceRenderer {
    frames: u64,
}

impl Renderer for TraceRenderer {
    fn render(&mut self, world: &WorldState) -> Result<(), CoreError> {
        self.frames += 1;
        debug!(
            frame = self.frames,
            drone_x = world.drone.0,
            drone_y = world.drone.1,
            obstacles = world.obstacles.len(),
            targets = world.targets.len(),
            reached = world.targets_reached,
            "World"
        );
        if tracing::enabled!(tracing::Level::TRACE) {
            if let Ok(snapshot) = serde_json::to_string(world) {
                tracing::trace!(%snapshot, "World snapshot");
            }
        }
        Ok(())
    }

    fn status(&mut self, line: &str) -> Result<(), CoreError> {
        info!("{}", line);
        Ok(())
    }
}

/// UI source fed from a channel (headless quit handler, tests).
#[derive(Debug)]
pub struct ChannelUi {
    rx: mpsc::UnboundedReceiver<UiEvent>,
}

impl ChannelUi {
    pub fn new() -> (mpsc::UnboundedSender<UiEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

impl UiSource for ChannelUi {
    fn poll_event(&mut self) -> Result<Option<UiEvent>, CoreError> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ui_is_non_blocking() {
        let (tx, mut ui) = ChannelUi::new();
        assert_eq!(ui.poll_event().unwrap(), None);
        tx.send(UiEvent::Key('e')).unwrap();
        tx.send(UiEvent::Quit).unwrap();
        assert_eq!(ui.poll_event().unwrap(), Some(UiEvent::Key('e')));
        assert_eq!(ui.poll_event().unwrap(), Some(UiEvent::Quit));
        drop(tx);
        assert_eq!(ui.poll_event().unwrap(), None);
    }
}
