//! Bounded, delta-timed MIDI dispatch. Events are stored in a fixed inline
//! buffer kept sorted by absolute due time; a full buffer drops new events
//! rather than displacing scheduled ones.

use log::warn;

use crate::hardware::Hardware;
use crate::midi::{self, MidiMessage, ScheduledMidi};

/// Live events the scheduler can hold. The 65th concurrent event is dropped.
pub const SCHEDULER_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    message: MidiMessage,
    channel: u8,
    due_ms: u32,
}

/// Sorted fixed-capacity queue of pending MIDI, emitted through the hardware
/// port as each event's absolute time arrives.
pub struct MidiScheduler {
    slots: [Slot; SCHEDULER_CAPACITY],
    len: usize,
    dropped: u32,
}

impl Default for MidiScheduler {
    fn default() -> MidiScheduler {
        MidiScheduler::new()
    }
}

impl MidiScheduler {
    pub fn new() -> MidiScheduler {
        MidiScheduler {
            slots: [Slot::default(); SCHEDULER_CAPACITY],
            len: 0,
            dropped: 0,
        }
    }

    /// Queue `event` for emission `event.delta_ms` after `now_ms`. Returns
    /// false when the event was dropped (buffer full or empty message).
    ///
    /// Insertion keeps the buffer sorted by due time and is stable: an event
    /// lands after everything already due at the same time, so batches drain
    /// in the order they were scheduled.
    pub fn schedule(&mut self, event: ScheduledMidi, now_ms: u32) -> bool {
        if event.message.is_empty() {
            return false;
        }
        if self.len == SCHEDULER_CAPACITY {
            self.dropped = self.dropped.wrapping_add(1);
            warn!(
                "[scheduler] queue full, dropping event (dropped={})",
                self.dropped
            );
            return false;
        }
        let due_ms = now_ms.wrapping_add(event.delta_ms);
        let mut index = self.len;
        for i in 0..self.len {
            if time_after(self.slots[i].due_ms, due_ms) {
                index = i;
                break;
            }
        }
        let mut j = self.len;
        while j > index {
            self.slots[j] = self.slots[j - 1];
            j -= 1;
        }
        self.slots[index] = Slot {
            message: event.message,
            channel: event.channel,
            due_ms,
        };
        self.len += 1;
        true
    }

    /// Queue every event in `events`; ties keep input order.
    pub fn schedule_batch(
        &mut self,
        events: impl IntoIterator<Item = ScheduledMidi>,
        now_ms: u32,
    ) {
        for event in events {
            self.schedule(event, now_ms);
        }
    }

    /// Emit every event due at or before `now_ms`, oldest first.
    pub fn update(&mut self, now_ms: u32, hardware: &mut impl Hardware) {
        let mut emitted = 0;
        while emitted < self.len && time_reached(now_ms, self.slots[emitted].due_ms) {
            hardware.send_midi(self.slots[emitted].message);
            emitted += 1;
        }
        if emitted > 0 {
            for i in emitted..self.len {
                self.slots[i - emitted] = self.slots[i];
            }
            self.len -= emitted;
        }
    }

    /// Discard everything queued without emitting.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn queued_count(&self) -> usize {
        self.len
    }

    pub fn dropped_count(&self) -> u32 {
        self.dropped
    }

    // Realtime messages bypass the queue entirely.

    pub fn send_clock(&mut self, hardware: &mut impl Hardware) {
        hardware.send_midi(MidiMessage::realtime(midi::TIMING_CLOCK));
    }

    pub fn send_start(&mut self, hardware: &mut impl Hardware) {
        hardware.send_midi(MidiMessage::realtime(midi::START));
    }

    pub fn send_stop(&mut self, hardware: &mut impl Hardware) {
        hardware.send_midi(MidiMessage::realtime(midi::STOP));
    }

    pub fn send_continue(&mut self, hardware: &mut impl Hardware) {
        hardware.send_midi(MidiMessage::realtime(midi::CONTINUE));
    }
}

/// True when `now` has reached or passed `due`, tolerating wraparound.
/// Deltas are assumed to stay under 2^31 ms.
fn time_reached(now: u32, due: u32) -> bool {
    now.wrapping_sub(due) as i32 >= 0
}

/// True when `a` is strictly later than `b`, tolerating wraparound.
fn time_after(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 > 0
}
