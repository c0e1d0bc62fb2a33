//! The single status LED, driven as a small state machine over named,
//! time-parameterized blink patterns.

use crate::hardware::Hardware;

/// Named LED patterns. Finite patterns fall back to [`LedPattern::TempoBeat`]
/// when their schedule completes; `TempoBeat` and `MirrorMode` run until
/// replaced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LedPattern {
    /// 50ms pulse retriggered by the engine on every beat.
    #[default]
    TempoBeat,
    /// Two fast blinks acknowledging a step button press.
    ButtonHeld,
    /// Five 100ms blinks while a song is written out.
    Saving,
    /// One slow 500ms/500ms pulse while a song loads.
    Loading,
    /// Three sharp 50ms blinks.
    Error,
    /// Alternating long/short flash until cleared.
    MirrorMode,
}

impl LedPattern {
    /// Total schedule length in ms; None for continuous patterns.
    fn duration_ms(&self) -> Option<u32> {
        match self {
            LedPattern::TempoBeat => None,
            LedPattern::ButtonHeld => Some(200),
            LedPattern::Saving => Some(1000),
            LedPattern::Loading => Some(1000),
            LedPattern::Error => Some(300),
            LedPattern::MirrorMode => None,
        }
    }

    fn is_on_at(&self, elapsed_ms: u32) -> bool {
        match self {
            LedPattern::TempoBeat => elapsed_ms < 50,
            LedPattern::ButtonHeld => (elapsed_ms / 50) % 2 == 0,
            LedPattern::Saving => (elapsed_ms / 100) % 2 == 0,
            LedPattern::Loading => elapsed_ms % 1000 < 500,
            LedPattern::Error => (elapsed_ms / 50) % 2 == 0,
            LedPattern::MirrorMode => elapsed_ms % 300 < 200,
        }
    }
}

impl TryFrom<&str> for LedPattern {
    type Error = ();

    fn try_from(name: &str) -> Result<LedPattern, ()> {
        match name {
            "tempo_beat" => Ok(LedPattern::TempoBeat),
            "button_held" => Ok(LedPattern::ButtonHeld),
            "saving" => Ok(LedPattern::Saving),
            "loading" => Ok(LedPattern::Loading),
            "error" => Ok(LedPattern::Error),
            "mirror" | "mirror_mode" => Ok(LedPattern::MirrorMode),
            _ => Err(()),
        }
    }
}

/// Plays one pattern at a time through the hardware LED. Brightness is
/// accepted for PWM-capable ports and ignored otherwise.
#[derive(Clone, Copy, Debug)]
pub struct LedController {
    pattern: LedPattern,
    started_ms: u32,
    brightness: u8,
}

impl Default for LedController {
    fn default() -> LedController {
        LedController::new()
    }
}

impl LedController {
    pub fn new() -> LedController {
        LedController {
            pattern: LedPattern::TempoBeat,
            // ensure the tempo pulse is dark until the first beat triggers it
            started_ms: u32::MAX / 2,
            brightness: 255,
        }
    }

    pub fn pattern(&self) -> LedPattern {
        self.pattern
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }

    /// Replace the active pattern, restarting its schedule at `now_ms`.
    pub fn trigger(&mut self, pattern: LedPattern, brightness: u8, now_ms: u32) {
        self.pattern = pattern;
        self.brightness = brightness;
        self.started_ms = now_ms;
    }

    /// Drop back to the dark tempo-beat default, e.g. to leave mirror mode.
    pub fn clear(&mut self, now_ms: u32) {
        self.pattern = LedPattern::TempoBeat;
        self.started_ms = now_ms.wrapping_sub(50);
    }

    /// Write the LED state for `now_ms` through the hardware port.
    pub fn update(&mut self, now_ms: u32, hardware: &mut impl Hardware) {
        let elapsed = now_ms.wrapping_sub(self.started_ms);
        if let Some(duration) = self.pattern.duration_ms() {
            if elapsed >= duration {
                self.pattern = LedPattern::TempoBeat;
                // elapsed keeps counting from the old start, so the pulse
                // window is already past and the LED rests dark
            }
        }
        hardware.set_led(self.pattern.is_on_at(elapsed));
    }
}
