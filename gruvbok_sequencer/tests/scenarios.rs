//! End-to-end behaviour of the engine over fake hardware with a manually
//! advanced clock.

use gruvbok_sequencer::engine::Engine;
use gruvbok_sequencer::hardware::FakeHardware;
use gruvbok_sequencer::midi;

const VOICE_SCRIPT: &str = r#"
    let MODE_NAME = "Plain Voice";

    fn init(ctx) {
    }

    fn process_event(track, event) {
        if event.switch {
            note(event.pots[0], event.pots[1] + velocity_offset());
            off(event.pots[0], 100);
        }
    }
"#;

fn engine() -> Engine<FakeHardware> {
    Engine::new(FakeHardware::new(), "unused-mode-dir")
}

/// Step `engine` forward in `step_ms` slices, one update per slice.
fn run_for(engine: &mut Engine<FakeHardware>, total_ms: u32, step_ms: u32) {
    let mut elapsed = 0;
    while elapsed < total_ms {
        engine.hardware_mut().advance(step_ms);
        engine.update();
        elapsed += step_ms;
    }
}

fn note_on_pitches(engine: &Engine<FakeHardware>, channel: u8) -> Vec<u8> {
    engine
        .hardware()
        .sent
        .iter()
        .filter(|(_, m)| m.status() == midi::NOTE_ON | channel)
        .map(|(_, m)| m.bytes()[1])
        .collect()
}

#[test]
fn steps_advance_every_125ms_at_120_bpm() {
    let mut engine = engine();
    engine.start();
    assert_eq!(0, engine.playback().current_step());

    engine.hardware_mut().advance(125);
    engine.update();
    assert_eq!(1, engine.playback().current_step());

    for expected in [2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 0] {
        engine.hardware_mut().advance(125);
        engine.update();
        assert_eq!(expected, engine.playback().current_step());
    }
}

#[test]
fn transport_emits_start_stop_and_clock() {
    let mut engine = engine();
    engine.start();
    assert_eq!(1, engine.hardware().count_status(midi::START));

    run_for(&mut engine, 125, 1);
    let clocks = engine.hardware().count_status(midi::TIMING_CLOCK);
    assert!(
        (5..=7).contains(&clocks),
        "expected 6±1 clock pulses in a 125ms window, saw {clocks}"
    );

    engine.stop();
    assert_eq!(1, engine.hardware().count_status(midi::STOP));

    // stopped transport emits no further pulses
    engine.hardware_mut().clear_sent();
    run_for(&mut engine, 500, 1);
    assert_eq!(0, engine.hardware().count_status(midi::TIMING_CLOCK));
}

#[test]
fn programmed_steps_play_through_their_mode_script() {
    let mut engine = engine();
    assert!(engine.load_mode_script_source(1, VOICE_SCRIPT));

    engine.with_event_mut(1, 0, 0, 4, |event| {
        event.set_switch(true);
        event.set_pot(0, 60);
        event.set_pot(1, 100);
    });

    engine.start();
    run_for(&mut engine, 125 * 16, 1);

    let pitches = note_on_pitches(&engine, 1);
    assert_eq!(vec![60], pitches);
}

#[test]
fn note_offs_scheduled_by_scripts_fire_after_stop() {
    let mut engine = engine();
    engine.load_mode_script_source(1, VOICE_SCRIPT);
    engine.with_event_mut(1, 0, 0, 1, |event| {
        event.set_switch(true);
        event.set_pot(0, 64);
        event.set_pot(1, 90);
    });

    engine.start();
    run_for(&mut engine, 126, 1);
    engine.stop();

    let offs_before = engine.hardware().count_status(midi::NOTE_OFF | 1);
    assert_eq!(0, offs_before);

    run_for(&mut engine, 200, 1);
    assert_eq!(1, engine.hardware().count_status(midi::NOTE_OFF | 1));
}

#[test]
fn song_mode_rows_override_the_played_pattern() {
    let mut engine = engine();
    engine.load_mode_script_source(1, VOICE_SCRIPT);

    // same step, different pitch in pattern 0 and pattern 16
    engine.with_event_mut(1, 0, 0, 1, |event| {
        event.set_switch(true);
        event.set_pot(0, 60);
        event.set_pot(1, 100);
    });
    engine.with_event_mut(1, 16, 0, 1, |event| {
        event.set_switch(true);
        event.set_pot(0, 72);
        event.set_pot(1, 100);
    });
    // song mode: step 0 off, step 1 selects pattern 16 (pot0=64)
    engine.with_event_mut(0, 0, 0, 1, |event| {
        event.set_switch(true);
        event.set_pot(0, 64);
        event.set_pot(3, 64);
    });

    engine.start();
    // first 16-step cycle: song-mode step 0 is off, pattern 0 plays
    run_for(&mut engine, 125 * 16, 1);
    assert_eq!(vec![60], note_on_pitches(&engine, 1));

    // after the wrap the song-mode row advances to step 1 and pattern 16
    // takes over
    run_for(&mut engine, 125 * 16, 1);
    assert_eq!(vec![60, 72], note_on_pitches(&engine, 1));
}

#[test]
fn song_mode_velocity_offset_reaches_script_output() {
    let mut engine = engine();
    engine.load_mode_script_source(1, VOICE_SCRIPT);

    engine.with_event_mut(1, 0, 0, 1, |event| {
        event.set_switch(true);
        event.set_pot(0, 60);
        event.set_pot(1, 100);
    });
    // song-mode row on step 0: pattern 0, velocity offset 127-64 = +63
    engine.with_event_mut(0, 0, 0, 0, |event| {
        event.set_switch(true);
        event.set_pot(0, 0);
        event.set_pot(3, 127);
    });

    engine.start();
    run_for(&mut engine, 130, 1);

    let velocities: Vec<u8> = engine
        .hardware()
        .sent
        .iter()
        .filter(|(_, m)| m.status() == midi::NOTE_ON | 1)
        .map(|(_, m)| m.bytes()[2])
        .collect();
    // 100 + 63 clamps to 127
    assert_eq!(vec![127], velocities);
}

#[test]
fn tempo_changes_reinit_scripts_after_a_quiet_second() {
    let mut engine = engine();
    engine.load_mode_script_source(1, VOICE_SCRIPT);

    engine.set_tempo(180);
    engine.hardware_mut().advance(500);
    engine.set_tempo(90);

    let all_notes_off_count = |engine: &Engine<FakeHardware>| {
        engine
            .hardware()
            .sent
            .iter()
            .filter(|(_, m)| m.bytes().len() == 3 && m.bytes()[1] == 123)
            .count()
    };

    engine.hardware_mut().advance(499);
    engine.update();
    assert_eq!(0, all_notes_off_count(&engine), "no reinit inside the window");

    engine.hardware_mut().advance(501);
    engine.update();
    assert_eq!(
        15,
        all_notes_off_count(&engine),
        "reinit silences every channel once"
    );

    // the flag clears; later ticks do not reinit again
    engine.hardware_mut().advance(2000);
    engine.update();
    assert_eq!(15, all_notes_off_count(&engine));
}

#[test]
fn broken_mode_scripts_leave_other_modes_playing() {
    let mut engine = engine();
    engine.load_mode_script_source(1, VOICE_SCRIPT);
    assert!(!engine.load_mode_script_source(2, "fn init( {"));

    for mode in [1, 2] {
        engine.with_event_mut(mode, 0, 0, 1, |event| {
            event.set_switch(true);
            event.set_pot(0, 60);
            event.set_pot(1, 100);
        });
    }

    engine.start();
    run_for(&mut engine, 130, 1);

    assert_eq!(vec![60], note_on_pitches(&engine, 1));
    assert!(note_on_pitches(&engine, 2).is_empty());
}
