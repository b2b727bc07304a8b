//! Adaptive silence-floor estimator.
//!
//! ## Algorithm
//!
//! 1. A zero level carries no information and is ignored.
//! 2. A nonzero level below the current floor (or any nonzero level while the
//!    floor is still undetermined) becomes the new floor at once.
//! 3. Otherwise the level joins the current window, which tracks its own
//!    minimum. When the window holds `window_length` levels the floor moves to
//!    the geometric mean of the old floor and the window minimum.
//!
//! The floor therefore drops immediately but rises slowly, following a
//! participant whose comfort noise got louder without reacting to outliers.

use crate::scoring::MAX_LEVEL;

/// Default window: 15 s of levels at one level per 20 ms.
pub const DEFAULT_WINDOW_LENGTH: u32 = 15 * 1000 / 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoiseFloor {
    /// Current floor; 0 means not yet determined.
    min_level: u8,
    /// Minimum level seen in the open window; 0 when no window is open.
    next_min_level: u8,
    /// Levels accumulated in the open window.
    window_count: u32,
    window_length: u32,
}

impl NoiseFloor {
    pub fn new(window_length: u32) -> Self {
        Self {
            min_level: 0,
            next_min_level: 0,
            window_count: 0,
            window_length: window_length.max(1),
        }
    }

    /// Current silence floor (0 = undetermined).
    pub fn level(&self) -> u8 {
        self.min_level
    }

    /// Levels accumulated towards the next floor update.
    pub fn window_count(&self) -> u32 {
        self.window_count
    }

    /// Feed one accepted level.
    pub fn observe(&mut self, level: u8) {
        if level == 0 {
            return;
        }

        if self.min_level == 0 || self.min_level > level {
            self.min_level = level;
            self.reset_window();
            return;
        }

        if self.next_min_level == 0 {
            self.next_min_level = level;
            self.window_count = 1;
        } else {
            self.next_min_level = self.next_min_level.min(level);
            self.window_count += 1;
        }

        if self.window_count >= self.window_length {
            let mean = (f64::from(self.min_level) * f64::from(self.next_min_level)).sqrt();
            self.min_level = mean.round().clamp(0.0, f64::from(MAX_LEVEL)) as u8;
            self.reset_window();
        }
    }

    fn reset_window(&mut self) {
        self.next_min_level = 0;
        self.window_count = 0;
    }
}

impl Default for NoiseFloor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_LENGTH)
    }
}
