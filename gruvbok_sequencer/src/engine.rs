//! The kernel. Owns every subsystem and runs the millisecond tick: drain
//! host intents, poll input, keep the MIDI clock and step grid moving, hand
//! step events to mode scripts and their output to the scheduler.

use std::path::{Path, PathBuf};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info};

use crate::error::Result;
use crate::hardware::Hardware;
use crate::input::{self, InputState};
use crate::led::{LedController, LedPattern};
use crate::midi::MidiMessage;
use crate::persist;
use crate::playback::PlaybackState;
use crate::scheduler::MidiScheduler;
use crate::script::{ContextParams, ModeLoader};
use crate::song::Song;
use crate::song_mode::SongSequencer;
use crate::{NUM_MODES, NUM_STEPS, POT_COUNT};

/// Value-typed commands a host may send the engine from another thread.
/// They are drained at the top of every tick, so the kernel itself stays
/// single-threaded.
#[derive(Clone, Debug)]
pub enum Intent {
    ToggleStep {
        step: usize,
    },
    SetEventPot {
        mode: usize,
        pattern: usize,
        track: usize,
        step: usize,
        pot: usize,
        value: i32,
    },
    SetTempo(i32),
    SetMode(usize),
    SetPattern(usize),
    SetTrack(usize),
    SetTargetMode(usize),
    Start,
    Stop,
    Continue,
    LoadSong(PathBuf),
    SaveSong(PathBuf),
    LoadDemoContent,
    ReloadMode(usize),
    TriggerLed(LedPattern),
}

/// Handle hosts use to queue [`Intent`]s from other threads.
pub type IntentSender = Sender<Intent>;

/// The always-playing sequencer core, generic over its hardware port so
/// embedded hosts can monomorphise the whole tick path.
pub struct Engine<H: Hardware> {
    hardware: H,
    song: Song,
    song_name: String,
    playback: PlaybackState,
    song_sequencer: SongSequencer,
    scheduler: MidiScheduler,
    modes: ModeLoader,
    led: LedController,
    input: InputState,
    intent_tx: Sender<Intent>,
    intent_rx: Receiver<Intent>,
    dirty: bool,
}

impl<H: Hardware> Engine<H> {
    /// Build the engine around a hardware port and a mode script directory.
    /// A port that fails to initialise leaves the engine running with no
    /// real-world I/O rather than failing construction.
    pub fn new(mut hardware: H, modes_dir: impl Into<PathBuf>) -> Engine<H> {
        if !hardware.init() {
            error!("[engine] hardware port failed to initialise, continuing without I/O");
        }
        let (intent_tx, intent_rx) = unbounded();
        Engine {
            hardware,
            song: Song::new(),
            song_name: "untitled".to_string(),
            playback: PlaybackState::new(),
            song_sequencer: SongSequencer::new(),
            scheduler: MidiScheduler::new(),
            modes: ModeLoader::new(modes_dir),
            led: LedController::new(),
            input: InputState::new(),
            intent_tx,
            intent_rx,
            dirty: false,
        }
    }

    /// Load every mode script from the configured directory and run each
    /// script's `init`. Returns the number of modes that loaded.
    pub fn load_mode_scripts(&mut self) -> usize {
        let loaded = self.modes.load_all();
        self.reinit_contexts();
        loaded
    }

    /// Load one mode's script from in-memory source, for hosts that embed
    /// their scripts.
    pub fn load_mode_script_source(&mut self, mode: usize, source: &str) -> bool {
        if !self.modes.load_mode_source(mode, source) {
            return false;
        }
        let params = self.context_params_for(mode);
        if let Some(context) = self.modes.context_mut(mode) {
            context.set_params(params);
            context.call_init();
        }
        true
    }

    /// One cooperative tick. Never blocks; call on a ~1ms cadence. Late
    /// calls are caught up by the scheduler and the clock, which compare
    /// against `now_ms` rather than counting calls.
    pub fn update(&mut self) {
        self.drain_intents();
        self.hardware.update();
        let now = self.hardware.now_ms();
        self.scheduler.update(now, &mut self.hardware);
        self.read_input(now);
        if self.playback.script_reinit_pending(now) {
            self.reinit_after_tempo_change();
        }
        while self.playback.clock_pulse_ready(now) {
            self.scheduler.send_clock(&mut self.hardware);
            self.playback.count_clock_pulse();
        }
        self.process_step(now);
        self.led.update(now, &mut self.hardware);
    }

    /// Begin playback from step 0 and emit MIDI Start.
    pub fn start(&mut self) {
        let now = self.hardware.now_ms();
        self.playback.start(now);
        self.song_sequencer.reset();
        // make the song-mode row audible from the very first cycle
        self.song_sequencer
            .apply_parameters(&self.song, self.playback.pattern());
        self.push_params_to_contexts();
        self.scheduler.send_start(&mut self.hardware);
        info!("[engine] start at {} BPM", self.playback.tempo_bpm());
    }

    /// Halt step advancement and clock pulses and emit MIDI Stop. Queued
    /// events are left to drain so scheduled note-offs still fire.
    pub fn stop(&mut self) {
        self.playback.stop();
        self.scheduler.send_stop(&mut self.hardware);
        info!("[engine] stop");
    }

    /// Resume from the current step and emit MIDI Continue.
    pub fn continue_playback(&mut self) {
        let now = self.hardware.now_ms();
        self.playback.resume(now);
        self.scheduler.send_continue(&mut self.hardware);
        info!("[engine] continue");
    }

    pub fn set_tempo(&mut self, bpm: i32) {
        let now = self.hardware.now_ms();
        if self.playback.set_tempo(bpm, now) {
            self.dirty = true;
        }
    }

    pub fn set_mode(&mut self, mode: usize) {
        if self.playback.set_mode(mode) {
            self.dirty = true;
        }
    }

    pub fn set_pattern(&mut self, pattern: usize) {
        if self.playback.set_pattern(pattern) {
            self.dirty = true;
        }
    }

    pub fn set_track(&mut self, track: usize) {
        if self.playback.set_track(track) {
            self.dirty = true;
        }
    }

    pub fn set_target_mode(&mut self, mode: usize) {
        if self.playback.set_target_mode(mode) {
            self.dirty = true;
        }
    }

    /// Toggle the event under a step button at the current edit selection,
    /// capturing the live slider values when the step turns on.
    pub fn toggle_step(&mut self, step: usize) {
        let now = self.hardware.now_ms();
        self.toggle_step_at(step, now);
    }

    /// Direct event editing for same-thread hosts; out-of-range coordinates
    /// are silent no-ops. Cross-thread hosts go through [`Intent`]s instead.
    pub fn with_event_mut(
        &mut self,
        mode: usize,
        pattern: usize,
        track: usize,
        step: usize,
        f: impl FnOnce(&mut crate::song::Event),
    ) -> bool {
        let changed = self.song.with_event_mut(mode, pattern, track, step, f);
        if changed {
            self.dirty = true;
        }
        changed
    }

    /// Write the current song to `path`; clears the dirty flag on success.
    pub fn save_song(&mut self, path: &Path) -> Result<()> {
        let now = self.hardware.now_ms();
        match persist::save(&self.song, path, &self.song_name, self.playback.tempo_bpm()) {
            Ok(()) => {
                self.dirty = false;
                self.led.trigger(LedPattern::Saving, 255, now);
                Ok(())
            }
            Err(e) => {
                error!("[engine] save failed: {}", e);
                self.led.trigger(LedPattern::Error, 255, now);
                Err(e)
            }
        }
    }

    /// Replace the song from `path`. On any failure the current song is
    /// untouched and the error LED flashes.
    pub fn load_song(&mut self, path: &Path) -> Result<()> {
        let now = self.hardware.now_ms();
        match persist::load(path) {
            Ok((song, name, tempo)) => {
                self.song = song;
                self.song_name = name;
                self.playback.set_tempo(tempo, now);
                self.song_sequencer.reset();
                self.dirty = false;
                self.led.trigger(LedPattern::Loading, 255, now);
                Ok(())
            }
            Err(e) => {
                error!("[engine] load failed: {}", e);
                self.led.trigger(LedPattern::Error, 255, now);
                Err(e)
            }
        }
    }

    /// Factory content for a fresh unit: a few voices on pattern 0 plus a
    /// song-mode row, so the box plays something before anything is
    /// programmed by hand.
    pub fn load_demo_content(&mut self) {
        self.song.clear();

        // mode 1: a keys line on the beat
        for (step, pitch) in [(0, 48), (4, 55), (8, 60), (12, 52)] {
            self.program_demo_step(1, step, [pitch, 100, 64, 80]);
        }
        // mode 2: off-beat bass
        for (step, pitch) in [(0, 24), (3, 24), (8, 31), (11, 26)] {
            self.program_demo_step(2, step, [pitch, 110, 40, 0]);
        }
        // mode 3: a dense top line
        for step in [2, 6, 10, 14] {
            self.program_demo_step(3, step, [96, 80, 20, 110]);
        }
        // song mode: one row, pattern 0, neutral scale, no velocity offset
        self.song.with_event_mut(0, 0, 0, 0, |event| {
            event.set_switch(true);
            event.set_pot(0, 0);
            event.set_pot(1, 0);
            event.set_pot(2, 0);
            event.set_pot(3, 64);
        });

        self.song_name = "demo".to_string();
        self.song_sequencer.reset();
        self.dirty = true;
        info!("[engine] demo content loaded");
    }

    /// Discard and recreate one mode's script context. All Notes Off goes
    /// out first on the mode's channel and the scheduler is flushed, so the
    /// old context cannot leave notes hanging.
    pub fn reload_mode(&mut self, mode: usize) -> bool {
        if mode >= NUM_MODES {
            return false;
        }
        self.hardware.send_midi(MidiMessage::all_notes_off(mode as u8));
        self.scheduler.clear();
        if !self.modes.reload_mode(mode) {
            return false;
        }
        let params = self.context_params_for(mode);
        if let Some(context) = self.modes.context_mut(mode) {
            context.set_params(params);
            context.call_init();
        }
        true
    }

    /// Host-initiated LED feedback, by pattern name.
    pub fn trigger_led_pattern(&mut self, name: &str) -> bool {
        match LedPattern::try_from(name) {
            Ok(pattern) => {
                let now = self.hardware.now_ms();
                self.led.trigger(pattern, 255, now);
                true
            }
            Err(()) => false,
        }
    }

    /// Stop, silence every channel and bring the hardware port down.
    pub fn shutdown(&mut self) {
        self.stop();
        for channel in 0..NUM_MODES as u8 {
            self.hardware.send_midi(MidiMessage::all_notes_off(channel));
        }
        self.scheduler.clear();
        self.hardware.shutdown();
    }

    // --- observers ---------------------------------------------------------

    /// Cloneable sender for cross-thread hosts; see [`Intent`].
    pub fn intent_sender(&self) -> IntentSender {
        self.intent_tx.clone()
    }

    pub fn song(&self) -> &Song {
        &self.song
    }

    pub fn song_name(&self) -> &str {
        &self.song_name
    }

    pub fn playback(&self) -> &PlaybackState {
        &self.playback
    }

    pub fn song_sequencer(&self) -> &SongSequencer {
        &self.song_sequencer
    }

    pub fn scheduler_queue_depth(&self) -> usize {
        self.scheduler.queued_count()
    }

    pub fn scheduler_dropped(&self) -> u32 {
        self.scheduler.dropped_count()
    }

    pub fn led_pattern(&self) -> LedPattern {
        self.led.pattern()
    }

    pub fn mode_name(&self, mode: usize) -> Option<&str> {
        self.modes.context(mode).and_then(|c| c.mode_name())
    }

    pub fn mode_last_error(&self, mode: usize) -> Option<&str> {
        self.modes.context(mode).and_then(|c| c.last_error())
    }

    pub fn loaded_mode_count(&self) -> usize {
        self.modes.loaded_count()
    }

    /// True when anything worth persisting changed since the last save.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    // --- tick internals ----------------------------------------------------

    fn drain_intents(&mut self) {
        while let Ok(intent) = self.intent_rx.try_recv() {
            self.apply_intent(intent);
        }
    }

    fn apply_intent(&mut self, intent: Intent) {
        match intent {
            Intent::ToggleStep { step } => self.toggle_step(step),
            Intent::SetEventPot {
                mode,
                pattern,
                track,
                step,
                pot,
                value,
            } => {
                if self
                    .song
                    .with_event_mut(mode, pattern, track, step, |e| e.set_pot(pot, value))
                {
                    self.dirty = true;
                }
            }
            Intent::SetTempo(bpm) => self.set_tempo(bpm),
            Intent::SetMode(mode) => self.set_mode(mode),
            Intent::SetPattern(pattern) => self.set_pattern(pattern),
            Intent::SetTrack(track) => self.set_track(track),
            Intent::SetTargetMode(mode) => self.set_target_mode(mode),
            Intent::Start => self.start(),
            Intent::Stop => self.stop(),
            Intent::Continue => self.continue_playback(),
            Intent::LoadSong(path) => {
                let _ = self.load_song(&path);
            }
            Intent::SaveSong(path) => {
                let _ = self.save_song(&path);
            }
            Intent::LoadDemoContent => self.load_demo_content(),
            Intent::ReloadMode(mode) => {
                self.reload_mode(mode);
            }
            Intent::TriggerLed(pattern) => {
                let now = self.hardware.now_ms();
                self.led.trigger(pattern, 255, now);
            }
        }
    }

    fn read_input(&mut self, now: u32) {
        for pot in 0..POT_COUNT {
            let raw = self.hardware.read_rotary_pot(pot);
            if let Some(value) = self.input.rotary_moved(pot, raw) {
                self.apply_rotary(pot, value, now);
            }
        }
        for pot in 0..POT_COUNT {
            let raw = self.hardware.read_slider_pot(pot);
            self.input.latch_slider(pot, raw);
        }
        for button in 0..NUM_STEPS {
            let down = self.hardware.read_button(button);
            if self.input.button_pressed(button, down) {
                self.toggle_step_at(button, now);
            }
        }
    }

    fn apply_rotary(&mut self, pot: usize, value: u8, now: u32) {
        let changed = match pot {
            0 => self.playback.set_mode(input::mode_for(value)),
            1 => self.playback.set_tempo(input::tempo_for(value), now),
            2 => self.playback.set_pattern(input::pattern_for(value)),
            3 => self.playback.set_track(input::track_for(value)),
            _ => false,
        };
        if changed {
            self.dirty = true;
            debug!(
                "[engine] selection mode={} tempo={} pattern={} track={}",
                self.playback.mode(),
                self.playback.tempo_bpm(),
                self.playback.pattern(),
                self.playback.track()
            );
        }
    }

    fn toggle_step_at(&mut self, step: usize, now: u32) {
        let sliders = self.input.sliders();
        let mode = self.playback.mode();
        let pattern = self.playback.pattern();
        let track = self.playback.track();
        let changed = self.song.with_event_mut(mode, pattern, track, step, |event| {
            if event.get_switch() {
                // toggling off keeps the locked pot values for next time
                event.set_switch(false);
            } else {
                for pot in 0..POT_COUNT {
                    event.set_pot(pot, sliders[pot] as i32);
                }
                event.set_switch(true);
            }
        });
        if changed {
            self.dirty = true;
            self.led.trigger(LedPattern::ButtonHeld, 255, now);
        }
    }

    fn reinit_after_tempo_change(&mut self) {
        info!(
            "[engine] tempo settled at {} BPM, re-initialising mode scripts",
            self.playback.tempo_bpm()
        );
        for channel in 0..NUM_MODES as u8 {
            self.hardware.send_midi(MidiMessage::all_notes_off(channel));
        }
        self.reinit_contexts();
        self.playback.clear_script_reinit_pending();
    }

    fn process_step(&mut self, now: u32) {
        if !self.playback.should_advance_step(now) {
            return;
        }
        let step = self.playback.advance_step(now);
        if step == 0 {
            let pattern = self.playback.pattern();
            self.song_sequencer.advance(&self.song, pattern);
            self.song_sequencer.apply_parameters(&self.song, pattern);
            self.push_params_to_contexts();
        }

        let track = self.playback.track();
        for mode in 1..NUM_MODES {
            let pattern = self
                .song_sequencer
                .pattern_override(mode)
                .map(usize::from)
                .unwrap_or_else(|| self.playback.pattern());
            let event = self.song.event(mode, pattern, track, step);
            let Some(context) = self.modes.context_mut(mode) else {
                continue;
            };
            let output = context.call_process_event(track, event);
            self.scheduler.schedule_batch(output.midi.iter().copied(), now);
            if let Some(request) = output.led {
                self.led.trigger(request.pattern, request.brightness, now);
            }
        }

        if step % 4 == 0 && self.led.pattern() == LedPattern::TempoBeat {
            self.led.trigger(LedPattern::TempoBeat, 255, now);
        }
    }

    fn context_params_for(&self, mode: usize) -> ContextParams {
        ContextParams {
            tempo_bpm: self.playback.tempo_bpm(),
            scale_root: self.song_sequencer.scale_root(),
            scale_type: self.song_sequencer.scale_type(),
            velocity_offset: self.song_sequencer.velocity_offset(mode),
        }
    }

    fn push_params_to_contexts(&mut self) {
        for mode in 0..NUM_MODES {
            let params = self.context_params_for(mode);
            if let Some(context) = self.modes.context_mut(mode) {
                context.set_params(params);
            }
        }
    }

    fn reinit_contexts(&mut self) {
        for mode in 0..NUM_MODES {
            let params = self.context_params_for(mode);
            if let Some(context) = self.modes.context_mut(mode) {
                context.set_params(params);
                context.call_init();
            }
        }
    }

    fn program_demo_step(&mut self, mode: usize, step: usize, pots: [i32; POT_COUNT]) {
        self.song.with_event_mut(mode, 0, 0, step, |event| {
            event.set_switch(true);
            for (pot, value) in pots.iter().enumerate() {
                event.set_pot(pot, *value);
            }
        });
    }
}
