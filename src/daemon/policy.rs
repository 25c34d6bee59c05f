//! Display power and backlight policy, driven by relay power notifications.

use tracing::{debug, warn};

use super::hal::Backlight;
use crate::power::PowerState;

/// What the daemon must do for a power notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    /// Display already in the requested state.
    None,
    DisplayOff,
    DisplayOn,
    /// The producer went away; drop cached imports, leave the display alone.
    InvalidateCache,
}

#[derive(Debug)]
pub struct PowerPolicy<L> {
    backlight: Option<L>,
    default_level: u32,
    saved_level: u32,
    dimmed: bool,
    display_on: bool,
}

impl<L: Backlight> PowerPolicy<L> {
    /// The display is assumed on, as the daemon powers it on at startup.
    pub fn new(backlight: Option<L>, default_level: u32) -> Self {
        Self {
            backlight,
            default_level,
            saved_level: 0,
            dimmed: false,
            display_on: true,
        }
    }

    pub fn display_on(&self) -> bool {
        self.display_on
    }

    pub fn is_dimmed(&self) -> bool {
        self.dimmed
    }

    pub fn backlight(&self) -> Option<&L> {
        self.backlight.as_ref()
    }

    pub fn transition(&mut self, state: PowerState) -> PowerAction {
        match state {
            PowerState::Off if self.display_on => {
                self.display_on = false;
                self.dim();
                PowerAction::DisplayOff
            }
            PowerState::On if !self.display_on => {
                self.display_on = true;
                self.restore();
                PowerAction::DisplayOn
            }
            PowerState::NoConsumer => PowerAction::InvalidateCache,
            _ => PowerAction::None,
        }
    }

    fn dim(&mut self) {
        if self.dimmed {
            return;
        }
        let Some(backlight) = self.backlight.as_mut() else {
            return;
        };
        self.saved_level = backlight.get_level().unwrap_or_else(|err| {
            warn!("error reading backlight: {err:?}");
            0
        });
        if let Err(err) = backlight.set_level(0, 0) {
            warn!("error dimming backlight: {err:?}");
            return;
        }
        self.dimmed = true;
        debug!(saved = self.saved_level, "backlight dimmed");
    }

    fn restore(&mut self) {
        if !self.dimmed {
            return;
        }
        let Some(backlight) = self.backlight.as_mut() else {
            return;
        };
        let level = match self.saved_level {
            0 => self.default_level,
            level => level,
        };
        if let Err(err) = backlight.set_level(level, 0) {
            warn!("error restoring backlight: {err:?}");
        }
        self.dimmed = false;
        debug!(level, "backlight restored");
    }
}
