//! Crossterm renderer and keyboard source for the coordinator.
//!
//! Screen layout: row 0 is the status line, the playable window starts at
//! row 1. World cell `(x, y)` is drawn at column `x`, row `y + 1`.

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute, queue,
    style::Print,
    terminal::{self, disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen},
};
use dronegrid_core::{CoreError, Renderer, UiEvent, UiSource, WorldState};
use std::io::{self, Stdout, Write};
use std::time::Duration;
use tracing::debug;

/// Rows reserved above the playable window.
pub const STATUS_ROWS: u16 = 1;

fn ui_err(e: io::Error) -> CoreError {
    CoreError::ui(e.to_string())
}

/// Playable window for a terminal of `cols` x `rows`.
pub fn window_for(cols: u16, rows: u16) -> (i32, i32) {
    (cols as i32, rows.saturating_sub(STATUS_ROWS) as i32)
}

/// Playable window of the current terminal.
pub fn current_window() -> Result<(i32, i32), CoreError> {
    let (cols, rows) = terminal::size().map_err(ui_err)?;
    Ok(window_for(cols, rows))
}

// ============================================================================
// RENDERER
// ============================================================================

/// Draws the world with plain characters.
pub struct TerminalRenderer<W: Write + Send> {
    out: W,
    /// Raw mode and the alternate screen are ours to restore
    owns_terminal: bool,
}

impl TerminalRenderer<Stdout> {
    /// Takes over the terminal: raw mode, alternate screen, hidden cursor.
    pub fn stdout() -> Result<Self, CoreError> {
        enable_raw_mode().map_err(ui_err)?;
        let mut out = io::stdout();
        if let Err(e) = execute!(out, EnterAlternateScreen, Hide) {
            let _ = disable_raw_mode();
            return Err(ui_err(e));
        }
        Ok(Self {
            out,
            owns_terminal: true,
        })
    }
}

impl<W: Write + Send> TerminalRenderer<W> {
    /// Draws into an arbitrary writer without touching terminal modes.
    pub fn with_writer(out: W) -> Self {
        Self {
            out,
            owns_terminal: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn put(&mut self, x: i32, y: i32, text: &str) -> io::Result<()> {
        if x < 0 || y < 0 {
            return Ok(());
        }
        let (Ok(col), Ok(row)) = (u16::try_from(x), u16::try_from(y)) else {
            return Ok(());
        };
        queue!(self.out, MoveTo(col, row.saturating_add(STATUS_ROWS)), Print(text))
    }

    fn draw(&mut self, world: &WorldState) -> io::Result<()> {
        let (width, height) = world.window;
        queue!(self.out, MoveTo(0, STATUS_ROWS), Clear(ClearType::FromCursorDown))?;

        if width >= 2 && height >= 2 {
            let horizontal = format!("+{}+", "-".repeat((width - 2) as usize));
            self.put(0, 0, &horizontal)?;
            self.put(0, height - 1, &horizontal)?;
            for y in 1..height - 1 {
                self.put(0, y, "|")?;
                self.put(width - 1, y, "|")?;
            }
        }

        for obstacle in &world.obstacles {
            self.put(obstacle.x, obstacle.y, "O")?;
        }
        for (index, target) in world.targets.iter().enumerate() {
            let label = (index as u32 + world.targets_reached + 1).to_string();
            self.put(target.x, target.y, &label)?;
        }
        if let Some((x, y)) = world.remote_drone {
            self.put(x as i32, y as i32, "*")?;
        }
        let drone = world.drone_cell();
        self.put(drone.x, drone.y, "+")?;
        self.out.flush()
    }
}

impl<W: Write + Send> Renderer for TerminalRenderer<W> {
    fn render(&mut self, world: &WorldState) -> Result<(), CoreError> {
        self.draw(world).map_err(ui_err)
    }

    fn status(&mut self, line: &str) -> Result<(), CoreError> {
        queue!(self.out, MoveTo(0, 0), Clear(ClearType::CurrentLine), Print(line)).map_err(ui_err)?;
        self.out.flush().map_err(ui_err)
    }

    fn shutdown(&mut self) -> Result<(), CoreError> {
        if !self.owns_terminal {
            return Ok(());
        }
        self.owns_terminal = false;
        execute!(self.out, Show, LeaveAlternateScreen).map_err(ui_err)?;
        disable_raw_mode().map_err(ui_err)?;
        debug!("Terminal restored");
        Ok(())
    }
}

// ============================================================================
// KEYBOARD
// ============================================================================

/// Maps one terminal event to a coordinator UI event.
pub fn translate(event: Event) -> Option<UiEvent> {
    match event {
        Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press | KeyEventKind::Repeat,
            ..
        }) => match code {
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => Some(UiEvent::Quit),
            KeyCode::Char(c) => Some(UiEvent::Key(c.to_ascii_lowercase())),
            _ => None,
        },
        Event::Resize(cols, rows) => {
            let (width, height) = window_for(cols, rows);
            Some(UiEvent::Resize { width, height })
        }
        _ => None,
    }
}

/// Non-blocking keyboard and resize source.
#[derive(Debug, Default)]
pub struct TerminalUi;

impl UiSource for TerminalUi {
    fn poll_event(&mut self) -> Result<Option<UiEvent>, CoreError> {
        while event::poll(Duration::ZERO).map_err(ui_err)? {
            if let Some(ui) = translate(event::read().map_err(ui_err)?) {
                return Ok(Some(ui));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dronegrid_env::Point;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent::new(code, modifiers))
    }

    #[test]
    fn test_translate_keys() {
        assert_eq!(translate(key(KeyCode::Char('f'), KeyModifiers::NONE)), Some(UiEvent::Key('f')));
        assert_eq!(translate(key(KeyCode::Char('Q'), KeyModifiers::SHIFT)), Some(UiEvent::Key('q')));
        assert_eq!(translate(key(KeyCode::Char('c'), KeyModifiers::CONTROL)), Some(UiEvent::Quit));
        assert_eq!(translate(key(KeyCode::Esc, KeyModifiers::NONE)), None);
    }

    #[test]
    fn test_resize_reserves_status_row() {
        assert_eq!(
            translate(Event::Resize(100, 30)),
            Some(UiEvent::Resize { width: 100, height: 29 })
        );
    }

    #[test]
    fn test_draws_entities() {
        let mut world = WorldState::new();
        world.window = (20, 10);
        world.drone = (5.5, 4.2);
        world.obstacles = vec![Point::new(2, 2)];
        world.targets = vec![Point::new(8, 3), Point::new(9, 6)];
        world.targets_reached = 2;

        let mut renderer = TerminalRenderer::with_writer(Vec::new());
        renderer.render(&world).unwrap();
        renderer.status("x=5.5000").unwrap();
        let output = String::from_utf8_lossy(&renderer.into_inner()).to_string();

        assert!(output.contains('O'));
        assert!(output.contains('+'));
        assert!(output.contains('3'));
        assert!(output.contains('4'));
        assert!(output.contains("x=5.5000"));
    }
}
