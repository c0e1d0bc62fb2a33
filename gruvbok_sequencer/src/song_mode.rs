//! The Mode-0 meta-sequencer. Mode 0's events do not make sound: each step
//! of its track 0 selects the patterns and musical parameters modes 1..14
//! play with, advancing once per full 16-step cycle of the main grid.

use crate::song::Song;
use crate::{NUM_MODES, NUM_PATTERNS, NUM_STEPS, SONG_MODE};

const SCALE_ROOTS: u8 = 12;
const SCALE_TYPES: u8 = 8;

/// Derived song-mode state: the slow step counter, loop length and the
/// per-mode overrides parsed from the current Mode-0 event.
#[derive(Clone, Debug)]
pub struct SongSequencer {
    step: usize,
    loop_length: usize,
    pattern_override: [Option<u8>; NUM_MODES],
    velocity_offset: [i8; NUM_MODES],
    scale_root: u8,
    scale_type: u8,
}

impl Default for SongSequencer {
    fn default() -> SongSequencer {
        SongSequencer::new()
    }
}

impl SongSequencer {
    pub fn new() -> SongSequencer {
        SongSequencer {
            step: 0,
            loop_length: NUM_STEPS,
            pattern_override: [None; NUM_MODES],
            velocity_offset: [0; NUM_MODES],
            scale_root: 0,
            scale_type: 0,
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn loop_length(&self) -> usize {
        self.loop_length
    }

    /// Pattern override for `mode`, if the current song-mode step sets one.
    pub fn pattern_override(&self, mode: usize) -> Option<u8> {
        self.pattern_override.get(mode).copied().flatten()
    }

    pub fn velocity_offset(&self, mode: usize) -> i8 {
        self.velocity_offset.get(mode).copied().unwrap_or(0)
    }

    pub fn scale_root(&self) -> u8 {
        self.scale_root
    }

    pub fn scale_type(&self) -> u8 {
        self.scale_type
    }

    /// Loop length is the highest on-step in track 0 of Mode 0's selected
    /// pattern, plus one; 16 when the track is empty.
    pub fn calculate_loop_length(&mut self, song: &Song, pattern: usize) -> usize {
        let mut length = NUM_STEPS;
        if let Some(track) = song
            .mode(SONG_MODE)
            .and_then(|m| m.pattern(pattern))
            .and_then(|p| p.track(0))
        {
            let max_on = (0..NUM_STEPS)
                .filter(|&s| track.event(s).get_switch())
                .max();
            length = max_on.map(|s| s + 1).unwrap_or(NUM_STEPS);
        }
        self.loop_length = length.clamp(1, NUM_STEPS);
        self.loop_length
    }

    /// Advance one song-mode step. Called when the main 16-step counter
    /// wraps; the loop length is recomputed first so live edits take effect
    /// on the next cycle.
    pub fn advance(&mut self, song: &Song, pattern: usize) {
        self.calculate_loop_length(song, pattern);
        self.step = (self.step + 1) % self.loop_length;
    }

    /// Rewind to step 0, e.g. when the transport restarts or a song loads.
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Parse the current step's event on track 0 and broadcast the result to
    /// modes 1..14. An on-event maps pot 0 to a pattern, pots 1 and 2 to the
    /// shared scale, and pot 3 to a velocity offset; an off-event withdraws
    /// the pattern and velocity overrides and leaves the scale alone.
    pub fn apply_parameters(&mut self, song: &Song, pattern: usize) {
        let event = song.event(SONG_MODE, pattern, 0, self.step);
        if event.get_switch() {
            let pattern_choice = (event.get_pot(0) as usize * NUM_PATTERNS / 128) as u8;
            self.scale_root = (event.get_pot(1) as u16 * SCALE_ROOTS as u16 / 128) as u8;
            self.scale_type = (event.get_pot(2) as u16 * SCALE_TYPES as u16 / 128) as u8;
            let offset = event.get_pot(3) as i16 - 64;
            for mode in 1..NUM_MODES {
                self.pattern_override[mode] = Some(pattern_choice);
                self.velocity_offset[mode] = offset as i8;
            }
        } else {
            for mode in 1..NUM_MODES {
                self.pattern_override[mode] = None;
                self.velocity_offset[mode] = 0;
            }
        }
    }
}
