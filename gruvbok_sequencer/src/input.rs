//! Kernel-side input mapping: rotary pots with hysteresis select what is
//! being edited, sliders are latched as live values, and step buttons are
//! edge-detected for parameter locking.

use crate::{NUM_MODES, NUM_PATTERNS, NUM_STEPS, NUM_TRACKS, POT_COUNT};

/// Minimum raw movement before a rotary change is accepted. Keeps ADC jitter
/// and slow drift from spamming selection changes.
pub const ROTARY_DEADBAND: u8 = 2;

/// Remembered control-surface state between ticks.
#[derive(Clone, Copy, Debug, Default)]
pub struct InputState {
    rotary_last: [Option<u8>; POT_COUNT],
    sliders: [u8; POT_COUNT],
    buttons: [bool; NUM_STEPS],
}

impl InputState {
    pub fn new() -> InputState {
        InputState::default()
    }

    /// Feed a rotary reading. Returns the accepted value when the pot has
    /// moved beyond the deadband. The first reading of each pot only
    /// establishes a baseline, so the physical positions at power-on do not
    /// clobber configured state.
    pub fn rotary_moved(&mut self, pot: usize, raw: u8) -> Option<u8> {
        let slot = self.rotary_last.get_mut(pot)?;
        match *slot {
            None => {
                *slot = Some(raw);
                None
            }
            Some(last) if last.abs_diff(raw) >= ROTARY_DEADBAND => {
                *slot = Some(raw);
                Some(raw)
            }
            Some(_) => None,
        }
    }

    /// Latch a slider reading as the live value for parameter locking.
    pub fn latch_slider(&mut self, pot: usize, raw: u8) {
        if let Some(slot) = self.sliders.get_mut(pot) {
            *slot = raw;
        }
    }

    pub fn sliders(&self) -> [u8; POT_COUNT] {
        self.sliders
    }

    /// Feed a button reading; returns true on the rising edge only.
    pub fn button_pressed(&mut self, button: usize, down: bool) -> bool {
        let Some(slot) = self.buttons.get_mut(button) else {
            return false;
        };
        let pressed = down && !*slot;
        *slot = down;
        pressed
    }
}

/// Rotary 1: mode selection over the full 0..15 range.
pub fn mode_for(raw: u8) -> usize {
    raw as usize * NUM_MODES / 128
}

/// Rotary 2: tempo over the usable 60..240 BPM range.
pub fn tempo_for(raw: u8) -> i32 {
    60 + raw as i32 * 180 / 127
}

/// Rotary 3: pattern selection.
pub fn pattern_for(raw: u8) -> usize {
    raw as usize * NUM_PATTERNS / 128
}

/// Rotary 4: track selection.
pub fn track_for(raw: u8) -> usize {
    raw as usize * NUM_TRACKS / 128
}
