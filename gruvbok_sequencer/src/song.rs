//! The programmable event store: a fixed tree of modes, patterns, tracks and
//! bit-packed events. Everything is inline arrays; the only allocation is one
//! heap block for the whole tree, made when the [`Song`] is created.

use crate::{NUM_MODES, NUM_PATTERNS, NUM_STEPS, NUM_TRACKS, POT_COUNT};

const SWITCH_BIT: u32 = 0x1;
const POT_MASK: u32 = 0x7F;
const POT_WIDTH: usize = 7;

/// One programmable step: a switch plus four 7-bit pot snapshots, packed into
/// 29 bits of a `u32`. Bit 0 is the switch, bits `1 + 7i .. 8 + 7i` are pot i.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Event(u32);

impl Event {
    pub fn new() -> Event {
        Event(0)
    }

    pub fn get_switch(&self) -> bool {
        self.0 & SWITCH_BIT != 0
    }

    pub fn set_switch(&mut self, on: bool) {
        if on {
            self.0 |= SWITCH_BIT;
        } else {
            self.0 &= !SWITCH_BIT;
        }
    }

    /// Pot value in 0..=127. Out-of-range pot numbers read as 0.
    pub fn get_pot(&self, pot: usize) -> u8 {
        if pot >= POT_COUNT {
            return 0;
        }
        ((self.0 >> (1 + pot * POT_WIDTH)) & POT_MASK) as u8
    }

    /// Store a pot value, clamped to 0..=127. Out-of-range pot numbers are
    /// ignored.
    pub fn set_pot(&mut self, pot: usize, value: i32) {
        if pot >= POT_COUNT {
            return;
        }
        let value = value.clamp(0, 127) as u32;
        let shift = 1 + pot * POT_WIDTH;
        self.0 = (self.0 & !(POT_MASK << shift)) | (value << shift);
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_clear(&self) -> bool {
        self.0 == 0
    }
}

/// 16 events on the step grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Track {
    events: [Event; NUM_STEPS],
}

impl Track {
    /// Event at `step`, or the zero event when `step` is out of range.
    pub fn event(&self, step: usize) -> Event {
        self.events.get(step).copied().unwrap_or_default()
    }

    pub fn event_mut(&mut self, step: usize) -> Option<&mut Event> {
        self.events.get_mut(step)
    }

    pub fn clear(&mut self) {
        self.events = [Event::default(); NUM_STEPS];
    }
}

/// 8 tracks sharing a 16-step timeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pattern {
    tracks: [Track; NUM_TRACKS],
}

impl Pattern {
    pub fn track(&self, track: usize) -> Option<&Track> {
        self.tracks.get(track)
    }

    pub fn track_mut(&mut self, track: usize) -> Option<&mut Track> {
        self.tracks.get_mut(track)
    }

    pub fn clear(&mut self) {
        self.tracks = [Track::default(); NUM_TRACKS];
    }
}

/// One voice's pattern bank: 32 patterns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mode {
    patterns: [Pattern; NUM_PATTERNS],
}

impl Default for Mode {
    fn default() -> Mode {
        Mode {
            patterns: [Pattern::default(); NUM_PATTERNS],
        }
    }
}

impl Mode {
    pub fn pattern(&self, pattern: usize) -> Option<&Pattern> {
        self.patterns.get(pattern)
    }

    pub fn pattern_mut(&mut self, pattern: usize) -> Option<&mut Pattern> {
        self.patterns.get_mut(pattern)
    }

    pub fn clear(&mut self) {
        self.patterns = [Pattern::default(); NUM_PATTERNS];
    }
}

/// The whole event tree: 15 modes of 32 patterns of 8 tracks of 16 events.
///
/// Owned for the process lifetime by the engine. Reads and writes with bad
/// coordinates are silent no-ops; reads return the zero event.
#[derive(Clone, Debug, PartialEq)]
pub struct Song {
    modes: Box<[Mode; NUM_MODES]>,
}

impl Default for Song {
    fn default() -> Song {
        Song::new()
    }
}

impl Song {
    pub fn new() -> Song {
        let modes: Box<[Mode]> = vec![Mode::default(); NUM_MODES].into_boxed_slice();
        let modes: Box<[Mode; NUM_MODES]> = modes
            .try_into()
            .expect("mode count is a compile-time constant");
        Song { modes }
    }

    pub fn mode(&self, mode: usize) -> Option<&Mode> {
        self.modes.get(mode)
    }

    pub fn mode_mut(&mut self, mode: usize) -> Option<&mut Mode> {
        self.modes.get_mut(mode)
    }

    /// O(1) read of the event at `(mode, pattern, track, step)`. Any bad
    /// coordinate yields the zero event.
    pub fn event(&self, mode: usize, pattern: usize, track: usize, step: usize) -> Event {
        self.mode(mode)
            .and_then(|m| m.pattern(pattern))
            .and_then(|p| p.track(track))
            .map(|t| t.event(step))
            .unwrap_or_default()
    }

    /// Mutate the event at `(mode, pattern, track, step)` in place. Returns
    /// false (without calling `f`) when any coordinate is out of range.
    pub fn with_event_mut(
        &mut self,
        mode: usize,
        pattern: usize,
        track: usize,
        step: usize,
        f: impl FnOnce(&mut Event),
    ) -> bool {
        let event = self
            .mode_mut(mode)
            .and_then(|m| m.pattern_mut(pattern))
            .and_then(|p| p.track_mut(track))
            .and_then(|t| t.event_mut(step));
        match event {
            Some(event) => {
                f(event);
                true
            }
            None => false,
        }
    }

    /// Replace the event at `(mode, pattern, track, step)`; no-op when out of
    /// range.
    pub fn set_event(
        &mut self,
        mode: usize,
        pattern: usize,
        track: usize,
        step: usize,
        event: Event,
    ) -> bool {
        self.with_event_mut(mode, pattern, track, step, |slot| *slot = event)
    }

    /// Zero every event in the tree.
    pub fn clear(&mut self) {
        for mode in self.modes.iter_mut() {
            mode.clear();
        }
    }

    /// Number of events with their switch on, across the whole tree.
    pub fn count_on_events(&self) -> usize {
        self.iter_on_events().count()
    }

    /// Iterate `(mode, pattern, track, step, event)` for every on-event.
    pub fn iter_on_events(&self) -> impl Iterator<Item = (usize, usize, usize, usize, Event)> + '_ {
        self.modes.iter().enumerate().flat_map(|(m, mode)| {
            mode.patterns.iter().enumerate().flat_map(move |(p, pattern)| {
                pattern.tracks.iter().enumerate().flat_map(move |(t, track)| {
                    track
                        .events
                        .iter()
                        .enumerate()
                        .filter(|(_, event)| event.get_switch())
                        .map(move |(s, event)| (m, p, t, s, *event))
                })
            })
        })
    }

    /// Size of the event tree in bytes. A compile-time constant.
    pub const fn memory_footprint() -> usize {
        NUM_MODES * NUM_PATTERNS * NUM_TRACKS * NUM_STEPS * core::mem::size_of::<Event>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_fields_pack_without_disturbing_each_other() {
        let mut event = Event::new();
        event.set_switch(true);
        event.set_pot(0, 11);
        event.set_pot(1, 22);
        event.set_pot(2, 33);
        event.set_pot(3, 44);
        event.set_switch(false);
        assert!(!event.get_switch());
        assert_eq!(11, event.get_pot(0));
        assert_eq!(22, event.get_pot(1));
        assert_eq!(33, event.get_pot(2));
        assert_eq!(44, event.get_pot(3));
    }

    #[test]
    fn event_pot_writes_clamp_to_midi_range() {
        let mut event = Event::new();
        event.set_pot(0, -5);
        event.set_pot(1, 128);
        event.set_pot(2, 1000);
        event.set_pot(3, 127);
        assert_eq!(0, event.get_pot(0));
        assert_eq!(127, event.get_pot(1));
        assert_eq!(127, event.get_pot(2));
        assert_eq!(127, event.get_pot(3));
    }

    #[test]
    fn event_out_of_range_pot_is_ignored() {
        let mut event = Event::new();
        event.set_pot(4, 99);
        assert!(event.is_clear());
        assert_eq!(0, event.get_pot(4));
    }

    #[test]
    fn default_event_is_all_zero() {
        let event = Event::default();
        assert!(!event.get_switch());
        for pot in 0..POT_COUNT {
            assert_eq!(0, event.get_pot(pot));
        }
    }

    #[test]
    fn song_reads_out_of_range_coordinates_as_zero() {
        let song = Song::new();
        assert!(song.event(NUM_MODES, 0, 0, 0).is_clear());
        assert!(song.event(0, NUM_PATTERNS, 0, 0).is_clear());
        assert!(song.event(0, 0, NUM_TRACKS, 0).is_clear());
        assert!(song.event(0, 0, 0, NUM_STEPS).is_clear());
    }

    #[test]
    fn song_writes_out_of_range_coordinates_are_rejected() {
        let mut song = Song::new();
        let mut event = Event::new();
        event.set_switch(true);
        assert!(!song.set_event(NUM_MODES, 0, 0, 0, event));
        assert!(!song.set_event(0, 0, 0, NUM_STEPS, event));
        assert_eq!(0, song.count_on_events());
    }

    #[test]
    fn song_round_trips_an_event_write() {
        let mut song = Song::new();
        let changed = song.with_event_mut(3, 17, 5, 9, |event| {
            event.set_switch(true);
            event.set_pot(2, 64);
        });
        assert!(changed);
        let event = song.event(3, 17, 5, 9);
        assert!(event.get_switch());
        assert_eq!(64, event.get_pot(2));
        assert_eq!(1, song.count_on_events());
    }

    #[test]
    fn song_clear_zeroes_every_event() {
        let mut song = Song::new();
        song.set_event(1, 0, 0, 0, on_event());
        song.set_event(14, 31, 7, 15, on_event());
        song.clear();
        assert_eq!(0, song.count_on_events());
        assert!(song.event(14, 31, 7, 15).is_clear());
    }

    #[test]
    fn memory_footprint_matches_tree_dimensions() {
        assert_eq!(15 * 32 * 8 * 16 * 4, Song::memory_footprint());
    }

    fn on_event() -> Event {
        let mut event = Event::new();
        event.set_switch(true);
        event.set_pot(0, 60);
        event
    }
}
