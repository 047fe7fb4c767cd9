// Physical input injection: the actuator seam plus its enigo implementation.
use async_trait::async_trait;
use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

use crate::action::ScrollDirection;
use crate::errors::{DeskPilotError, DeskPilotResult};

/// Low-level keyboard/mouse primitives. Calls are fire-and-forget: success
/// unless the OS layer reports an error.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn click(&self, x: i32, y: i32) -> DeskPilotResult<()>;
    async fn move_to(&self, x: i32, y: i32) -> DeskPilotResult<()>;
    async fn type_text(&self, text: &str) -> DeskPilotResult<()>;
    /// `combo` is a `+`-joined chord such as `ctrl+l`, `win+r` or `enter`.
    async fn press_key(&self, combo: &str) -> DeskPilotResult<()>;
    async fn scroll(&self, direction: ScrollDirection, amount: i32) -> DeskPilotResult<()>;
}

/// Drives the real keyboard and mouse. Each call runs on a blocking thread
/// with its own enigo connection.
pub struct EnigoActuator;

impl EnigoActuator {
    async fn run<F>(op: &'static str, f: F) -> DeskPilotResult<()>
    where
        F: FnOnce(&mut Enigo) -> Result<(), enigo::InputError> + Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            let mut enigo = Enigo::new(&Settings::default())
                .map_err(|e| DeskPilotError::Actuator(format!("enigo init: {e}")))?;
            f(&mut enigo).map_err(|e| DeskPilotError::Actuator(format!("{op}: {e}")))
        })
        .await
        .map_err(|e| DeskPilotError::Actuator(format!("join: {e}")))?
    }
}

#[async_trait]
impl Actuator for EnigoActuator {
    async fn click(&self, x: i32, y: i32) -> DeskPilotResult<()> {
        tracing::debug!(x, y, "click");
        Self::run("click", move |e| {
            e.move_mouse(x, y, Coordinate::Abs)?;
            e.button(Button::Left, Direction::Click)
        })
        .await
    }

    async fn move_to(&self, x: i32, y: i32) -> DeskPilotResult<()> {
        tracing::debug!(x, y, "move");
        Self::run("move", move |e| e.move_mouse(x, y, Coordinate::Abs)).await
    }

    async fn type_text(&self, text: &str) -> DeskPilotResult<()> {
        tracing::debug!(chars = text.chars().count(), "type");
        let text = text.to_string();
        Self::run("type", move |e| e.text(&text)).await
    }

    async fn press_key(&self, combo: &str) -> DeskPilotResult<()> {
        let keys = parse_combo(combo)
            .ok_or_else(|| DeskPilotError::Actuator(format!("unknown key combination: {combo}")))?;
        tracing::debug!(combo = %combo, "press");
        Self::run("press", move |e| {
            let (last, modifiers) = match keys.split_last() {
                Some(split) => split,
                None => return Ok(()),
            };
            for k in modifiers {
                e.key(*k, Direction::Press)?;
            }
            let res = e.key(*last, Direction::Click);
            // release in reverse order even if the final key failed
            for k in modifiers.iter().rev() {
                e.key(*k, Direction::Release)?;
            }
            res
        })
        .await
    }

    async fn scroll(&self, direction: ScrollDirection, amount: i32) -> DeskPilotResult<()> {
        let (axis, length) = scroll_motion(direction, amount);
        tracing::debug!(?direction, amount, "scroll");
        Self::run("scroll", move |e| e.scroll(length, axis)).await
    }
}

/// Wheel axis and signed notch count; up and left scroll negative.
fn scroll_motion(direction: ScrollDirection, amount: i32) -> (Axis, i32) {
    match direction {
        ScrollDirection::Up => (Axis::Vertical, amount.saturating_neg()),
        ScrollDirection::Down => (Axis::Vertical, amount),
        ScrollDirection::Left => (Axis::Horizontal, amount.saturating_neg()),
        ScrollDirection::Right => (Axis::Horizontal, amount),
    }
}

/// Expands named shortcuts and splits a chord into enigo keys, modifiers first.
pub fn parse_combo(combo: &str) -> Option<Vec<Key>> {
    let normalized = combo.trim().to_lowercase();
    let expanded = match normalized.as_str() {
        "minimize" => "win+down",
        "maximize" => "win+up",
        other => other,
    };
    expanded
        .split('+')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(key_from_name)
        .collect::<Option<Vec<_>>>()
        .filter(|keys| !keys.is_empty())
}

fn key_from_name(name: &str) -> Option<Key> {
    let key = match name {
        "ctrl" | "control" => Key::Control,
        "alt" => Key::Alt,
        "shift" => Key::Shift,
        "win" | "winleft" | "meta" | "super" | "cmd" | "command" => Key::Meta,
        "enter" | "return" => Key::Return,
        "tab" => Key::Tab,
        "esc" | "escape" => Key::Escape,
        "space" => Key::Space,
        "backspace" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        "up" => Key::UpArrow,
        "down" => Key::DownArrow,
        "left" => Key::LeftArrow,
        "right" => Key::RightArrow,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" => Key::PageUp,
        "pagedown" => Key::PageDown,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Key::Unicode(c),
                _ => return None,
            }
        }
    };
    Some(key)
}
