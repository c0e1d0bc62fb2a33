//! Per-mode script hosts. Each of the 15 modes owns an isolated rhai engine
//! that translates step events into MIDI through a small registered API.
//!
//! rhai is reference-counted rather than garbage-collected, so there are no
//! collection pauses to tune away; the real-time guard is a hard operation
//! budget on every call into a script. Script functions are pure, so the
//! live musical parameters (tempo, scale, velocity offset) are exposed as
//! registered query functions backed by a block the engine refreshes on
//! every song-mode change.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{info, warn};
use rhai::{Array, Dynamic, EvalAltResult, ImmutableString, Map, Scope, AST};

use crate::error::{Error, Result};
use crate::led::LedPattern;
use crate::midi::ScheduledMidi;
use crate::playback::DEFAULT_TEMPO;
use crate::song::Event;
use crate::{NUM_MODES, POT_COUNT};

/// MIDI events one `process_event` call may emit; extras are dropped.
pub const MAX_EVENTS_PER_CALL: usize = 32;

/// Interpreter operation budget per call into a script. Roughly a
/// millisecond of work; runaway scripts are aborted at this ceiling.
pub const MAX_OPS_PER_CALL: u64 = 50_000;

/// Everything a single script call produced.
#[derive(Clone, Debug, Default)]
pub struct CallOutput {
    pub midi: heapless::Vec<ScheduledMidi, MAX_EVENTS_PER_CALL>,
    pub led: Option<LedRequest>,
}

/// A script's request to play a named LED pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedRequest {
    pub pattern: LedPattern,
    pub brightness: u8,
}

/// Live musical parameters a context's query functions read. The engine
/// refreshes these on tempo changes and song-mode steps; scripts see the new
/// values on their next call without being re-initialised.
#[derive(Clone, Copy, Debug)]
pub struct ContextParams {
    pub tempo_bpm: i32,
    pub scale_root: u8,
    pub scale_type: u8,
    pub velocity_offset: i8,
}

impl Default for ContextParams {
    fn default() -> ContextParams {
        ContextParams {
            tempo_bpm: DEFAULT_TEMPO,
            scale_root: 0,
            scale_type: 0,
            velocity_offset: 0,
        }
    }
}

/// One mode's isolated interpreter plus its registered MIDI API.
pub struct ScriptContext {
    mode_number: usize,
    channel: u8,
    engine: rhai::Engine,
    ast: AST,
    scope: Scope<'static>,
    output: Rc<RefCell<CallOutput>>,
    params: Rc<RefCell<ContextParams>>,
    mode_name: Option<String>,
    slider_labels: Option<[String; POT_COUNT]>,
    last_error: Option<String>,
}

impl ScriptContext {
    /// Load and validate a script file. On any failure no context exists;
    /// there is no partially initialised state to clean up.
    pub fn load(mode_number: usize, path: &Path) -> Result<ScriptContext> {
        let source = fs::read_to_string(path).map_err(|e| Error::ScriptLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        ScriptContext::from_source(mode_number, &source).map_err(|message| Error::ScriptLoad {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Build a context from script source: compile, run the body once in the
    /// context scope, then verify the `init`/`process_event` entry points.
    pub fn from_source(
        mode_number: usize,
        source: &str,
    ) -> std::result::Result<ScriptContext, String> {
        let channel = mode_number as u8;
        let output = Rc::new(RefCell::new(CallOutput::default()));
        let params = Rc::new(RefCell::new(ContextParams::default()));

        let mut engine = rhai::Engine::new();
        engine.set_optimization_level(rhai::OptimizationLevel::None);
        engine.set_max_operations(MAX_OPS_PER_CALL);
        register_midi_api(&mut engine, channel, &output);
        register_param_api(&mut engine, mode_number, channel, &params);

        let ast = engine.compile(source).map_err(|e| e.to_string())?;

        let mut has_init = false;
        let mut has_process_event = false;
        for function in ast.iter_functions() {
            match (function.name, function.params.len()) {
                ("init", 1) => has_init = true,
                ("process_event", 2) => has_process_event = true,
                _ => {}
            }
        }
        if !has_init {
            return Err("script does not define init(context)".to_string());
        }
        if !has_process_event {
            return Err("script does not define process_event(track, event)".to_string());
        }

        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| e.to_string())?;

        let mode_name = scope
            .get_value::<ImmutableString>("MODE_NAME")
            .map(|s| s.to_string());
        let slider_labels = scope
            .get_value::<Array>("SLIDER_LABELS")
            .and_then(labels_from_array);

        // keep only the function definitions; the body has run and need not
        // be re-evaluated on every call
        let ast = ast.clone_functions_only();

        Ok(ScriptContext {
            mode_number,
            channel,
            engine,
            ast,
            scope,
            output,
            params,
            mode_name,
            slider_labels,
            last_error: None,
        })
    }

    pub fn mode_number(&self) -> usize {
        self.mode_number
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn mode_name(&self) -> Option<&str> {
        self.mode_name.as_deref()
    }

    pub fn slider_labels(&self) -> Option<&[String; POT_COUNT]> {
        self.slider_labels.as_ref()
    }

    /// Most recent runtime error, for host logging.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn params(&self) -> ContextParams {
        *self.params.borrow()
    }

    /// Refresh the live parameters the script's query functions read.
    pub fn set_params(&mut self, params: ContextParams) {
        *self.params.borrow_mut() = params;
    }

    /// Call the script's `init` with the context record. Returns false (and
    /// records the error) when the script raises.
    pub fn call_init(&mut self) -> bool {
        let params = *self.params.borrow();
        let mut context = Map::new();
        context.insert("tempo".into(), (params.tempo_bpm as i64).into());
        context.insert("mode_number".into(), (self.mode_number as i64).into());
        context.insert("midi_channel".into(), (self.channel as i64).into());
        context.insert("scale_root".into(), (params.scale_root as i64).into());
        context.insert("scale_type".into(), (params.scale_type as i64).into());
        context.insert(
            "velocity_offset".into(),
            (params.velocity_offset as i64).into(),
        );

        self.reset_output();
        let result =
            self.engine
                .call_fn::<Dynamic>(&mut self.scope, &self.ast, "init", (context,));
        // anything emitted during init is discarded; only process_event output
        // reaches the scheduler
        self.reset_output();
        match result {
            Ok(_) => true,
            Err(e) => {
                self.record_error("init", &e);
                false
            }
        }
    }

    /// The hot path: hand one step event to the script and collect the MIDI
    /// it emits. A runtime error or an exhausted operation budget yields
    /// empty output; the context stays valid for the next step.
    pub fn call_process_event(&mut self, track: usize, event: Event) -> CallOutput {
        self.reset_output();

        let mut record = Map::new();
        record.insert("switch".into(), event.get_switch().into());
        let pots: Array = (0..POT_COUNT)
            .map(|pot| Dynamic::from(event.get_pot(pot) as i64))
            .collect();
        record.insert("pots".into(), pots.into());

        let result = self.engine.call_fn::<Dynamic>(
            &mut self.scope,
            &self.ast,
            "process_event",
            (track as i64, record),
        );
        if let Err(e) = result {
            self.record_error("process_event", &e);
            self.reset_output();
        }
        self.output.borrow().clone()
    }

    fn reset_output(&mut self) {
        let mut output = self.output.borrow_mut();
        output.midi.clear();
        output.led = None;
    }

    fn record_error(&mut self, entry_point: &str, error: &EvalAltResult) {
        let message = match error {
            EvalAltResult::ErrorTooManyOperations(_) => {
                format!("{entry_point} exceeded the execution budget")
            }
            other => format!("{entry_point} failed: {other}"),
        };
        warn!("[script] mode {}: {}", self.mode_number, message);
        self.last_error = Some(message);
    }
}

fn labels_from_array(labels: Array) -> Option<[String; POT_COUNT]> {
    if labels.len() != POT_COUNT {
        return None;
    }
    let mut out: [String; POT_COUNT] = Default::default();
    for (slot, label) in out.iter_mut().zip(labels) {
        *slot = label.into_immutable_string().ok()?.to_string();
    }
    Some(out)
}

fn push_midi(output: &Rc<RefCell<CallOutput>>, event: ScheduledMidi) {
    // overflow beyond the per-call buffer is dropped, like the scheduler
    let _ = output.borrow_mut().midi.push(event);
}

fn clamp7(value: i64) -> u8 {
    value.clamp(0, 127) as u8
}

fn delta(value: i64) -> u32 {
    value.max(0) as u32
}

fn register_midi_api(engine: &mut rhai::Engine, channel: u8, output: &Rc<RefCell<CallOutput>>) {
    let out = Rc::clone(output);
    engine.register_fn("note", move |pitch: i64, velocity: i64| {
        push_midi(
            &out,
            ScheduledMidi::note_on(clamp7(pitch), clamp7(velocity), channel, 0),
        );
    });
    let out = Rc::clone(output);
    engine.register_fn("note", move |pitch: i64, velocity: i64, delta_ms: i64| {
        push_midi(
            &out,
            ScheduledMidi::note_on(clamp7(pitch), clamp7(velocity), channel, delta(delta_ms)),
        );
    });

    let out = Rc::clone(output);
    engine.register_fn("off", move |pitch: i64| {
        push_midi(&out, ScheduledMidi::note_off(clamp7(pitch), channel, 0));
    });
    let out = Rc::clone(output);
    engine.register_fn("off", move |pitch: i64, delta_ms: i64| {
        push_midi(
            &out,
            ScheduledMidi::note_off(clamp7(pitch), channel, delta(delta_ms)),
        );
    });

    let out = Rc::clone(output);
    engine.register_fn("cc", move |controller: i64, value: i64| {
        push_midi(
            &out,
            ScheduledMidi::cc(clamp7(controller), clamp7(value), channel, 0),
        );
    });
    let out = Rc::clone(output);
    engine.register_fn("cc", move |controller: i64, value: i64, delta_ms: i64| {
        push_midi(
            &out,
            ScheduledMidi::cc(clamp7(controller), clamp7(value), channel, delta(delta_ms)),
        );
    });

    let out = Rc::clone(output);
    engine.register_fn("stopall", move || {
        push_midi(&out, ScheduledMidi::all_notes_off(channel, 0));
    });
    let out = Rc::clone(output);
    engine.register_fn("stopall", move |delta_ms: i64| {
        push_midi(&out, ScheduledMidi::all_notes_off(channel, delta(delta_ms)));
    });

    let out = Rc::clone(output);
    engine.register_fn("led", move |name: ImmutableString| {
        if let Ok(pattern) = LedPattern::try_from(name.as_str()) {
            out.borrow_mut().led = Some(LedRequest {
                pattern,
                brightness: 255,
            });
        }
    });
    let out = Rc::clone(output);
    engine.register_fn("led", move |name: ImmutableString, brightness: i64| {
        if let Ok(pattern) = LedPattern::try_from(name.as_str()) {
            out.borrow_mut().led = Some(LedRequest {
                pattern,
                brightness: brightness.clamp(0, 255) as u8,
            });
        }
    });
}

fn register_param_api(
    engine: &mut rhai::Engine,
    mode_number: usize,
    channel: u8,
    params: &Rc<RefCell<ContextParams>>,
) {
    let p = Rc::clone(params);
    engine.register_fn("tempo", move || p.borrow().tempo_bpm as i64);
    let p = Rc::clone(params);
    engine.register_fn("scale_root", move || p.borrow().scale_root as i64);
    let p = Rc::clone(params);
    engine.register_fn("scale_type", move || p.borrow().scale_type as i64);
    let p = Rc::clone(params);
    engine.register_fn("velocity_offset", move || p.borrow().velocity_offset as i64);
    engine.register_fn("mode_number", move || mode_number as i64);
    engine.register_fn("midi_channel", move || channel as i64);
}

/// Owns the 15 script contexts and maps `NN_*.rhai` files onto mode numbers.
pub struct ModeLoader {
    dir: PathBuf,
    contexts: [Option<ScriptContext>; NUM_MODES],
}

impl ModeLoader {
    pub fn new(dir: impl Into<PathBuf>) -> ModeLoader {
        ModeLoader {
            dir: dir.into(),
            contexts: Default::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every mode script in the directory. Failures are logged and the
    /// affected mode stays silent; other modes are unaffected. Returns the
    /// number of contexts loaded.
    pub fn load_all(&mut self) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "[script] cannot read mode directory {}: {}",
                    self.dir.display(),
                    e
                );
                return 0;
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let Some(mode) = mode_number_from_path(&path) else {
                continue;
            };
            if self.load_mode(mode, &path) {
                loaded += 1;
            }
        }
        info!(
            "[script] loaded {} mode scripts from {}",
            loaded,
            self.dir.display()
        );
        loaded
    }

    /// Load or replace a single mode's script from `path`.
    pub fn load_mode(&mut self, mode: usize, path: &Path) -> bool {
        if mode >= NUM_MODES {
            return false;
        }
        match ScriptContext::load(mode, path) {
            Ok(context) => {
                info!(
                    "[script] mode {} <- {} ({})",
                    mode,
                    path.display(),
                    context.mode_name().unwrap_or("unnamed")
                );
                self.contexts[mode] = Some(context);
                true
            }
            Err(e) => {
                warn!("[script] {}", e);
                self.contexts[mode] = None;
                false
            }
        }
    }

    /// Load or replace a single mode's script from in-memory source.
    pub fn load_mode_source(&mut self, mode: usize, source: &str) -> bool {
        if mode >= NUM_MODES {
            return false;
        }
        match ScriptContext::from_source(mode, source) {
            Ok(context) => {
                self.contexts[mode] = Some(context);
                true
            }
            Err(message) => {
                warn!("[script] mode {}: {}", mode, message);
                self.contexts[mode] = None;
                false
            }
        }
    }

    /// Discard and recreate a mode's context from its file on disk.
    pub fn reload_mode(&mut self, mode: usize) -> bool {
        if mode >= NUM_MODES {
            return false;
        }
        match self.script_path_for(mode) {
            Some(path) => self.load_mode(mode, &path),
            None => {
                warn!("[script] no script file found for mode {}", mode);
                false
            }
        }
    }

    pub fn context(&self, mode: usize) -> Option<&ScriptContext> {
        self.contexts.get(mode).and_then(|c| c.as_ref())
    }

    pub fn context_mut(&mut self, mode: usize) -> Option<&mut ScriptContext> {
        self.contexts.get_mut(mode).and_then(|c| c.as_mut())
    }

    pub fn loaded_count(&self) -> usize {
        self.contexts.iter().filter(|c| c.is_some()).count()
    }

    fn script_path_for(&self, mode: usize) -> Option<PathBuf> {
        let entries = fs::read_dir(&self.dir).ok()?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| mode_number_from_path(path) == Some(mode))
            .collect();
        paths.sort();
        paths.into_iter().next()
    }
}

/// `07_bass.rhai` -> mode 7. Anything else is skipped.
fn mode_number_from_path(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".rhai")?;
    if stem.len() < 3 || stem.as_bytes()[2] != b'_' {
        return None;
    }
    let number: usize = stem[..2].parse().ok()?;
    if number < NUM_MODES {
        Some(number)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VOICE_SCRIPT: &str = r#"
        let MODE_NAME = "Test Voice";
        let SLIDER_LABELS = ["Pitch", "Velocity", "Gate", "Mod"];

        fn init(ctx) {
        }

        fn process_event(track, event) {
            if event.switch {
                note(event.pots[0], event.pots[1] + velocity_offset());
                off(event.pots[0], 100);
            }
        }
    "#;

    fn on_event(pitch: i32, velocity: i32) -> Event {
        let mut event = Event::new();
        event.set_switch(true);
        event.set_pot(0, pitch);
        event.set_pot(1, velocity);
        event
    }

    #[test]
    fn valid_script_loads_and_publishes_metadata() {
        let context = ScriptContext::from_source(3, VOICE_SCRIPT).unwrap();
        assert_eq!(Some("Test Voice"), context.mode_name());
        assert_eq!(
            "Pitch",
            context.slider_labels().expect("labels published")[0]
        );
        assert_eq!(3, context.channel());
    }

    #[test]
    fn missing_entry_points_fail_validation() {
        assert!(ScriptContext::from_source(1, "fn init(ctx) {}").is_err());
        assert!(ScriptContext::from_source(1, "fn process_event(t, e) {}").is_err());
        assert!(ScriptContext::from_source(1, "let x = 1;").is_err());
    }

    #[test]
    fn syntax_errors_fail_validation() {
        assert!(ScriptContext::from_source(1, "fn init( {").is_err());
    }

    #[test]
    fn process_event_emits_on_the_context_channel() {
        let mut context = ScriptContext::from_source(5, VOICE_SCRIPT).unwrap();
        assert!(context.call_init());
        let output = context.call_process_event(0, on_event(60, 100));
        assert_eq!(2, output.midi.len());
        assert_eq!(&[0x95, 60, 100], output.midi[0].message.bytes());
        assert_eq!(&[0x85, 60, 0x40], output.midi[1].message.bytes());
        assert_eq!(100, output.midi[1].delta_ms);
    }

    #[test]
    fn off_events_emit_nothing() {
        let mut context = ScriptContext::from_source(5, VOICE_SCRIPT).unwrap();
        let output = context.call_process_event(0, Event::new());
        assert!(output.midi.is_empty());
    }

    #[test]
    fn velocity_offset_query_reflects_live_params() {
        let mut context = ScriptContext::from_source(2, VOICE_SCRIPT).unwrap();
        context.set_params(ContextParams {
            velocity_offset: 20,
            ..ContextParams::default()
        });
        let output = context.call_process_event(0, on_event(60, 100));
        assert_eq!(&[0x92, 60, 120], output.midi[0].message.bytes());
    }

    #[test]
    fn emitted_values_clamp_to_midi_range() {
        let script = r#"
            fn init(ctx) {}
            fn process_event(track, event) {
                note(300, 999);
                cc(7, -5);
            }
        "#;
        let mut context = ScriptContext::from_source(1, script).unwrap();
        let output = context.call_process_event(0, Event::new());
        assert_eq!(&[0x91, 127, 127], output.midi[0].message.bytes());
        assert_eq!(&[0xB1, 7, 0], output.midi[1].message.bytes());
    }

    #[test]
    fn runtime_errors_yield_empty_output_and_keep_the_context() {
        let script = r#"
            fn init(ctx) {}
            fn process_event(track, event) {
                if event.switch {
                    this_function_does_not_exist();
                }
                note(60, 100);
            }
        "#;
        let mut context = ScriptContext::from_source(1, script).unwrap();

        let output = context.call_process_event(0, on_event(0, 0));
        assert!(output.midi.is_empty());
        assert!(context.last_error().is_some());

        // next call with a clean path still works
        let output = context.call_process_event(0, Event::new());
        assert_eq!(1, output.midi.len());
    }

    #[test]
    fn runaway_scripts_are_aborted_by_the_operation_budget() {
        let script = r#"
            fn init(ctx) {}
            fn process_event(track, event) {
                loop { }
            }
        "#;
        let mut context = ScriptContext::from_source(1, script).unwrap();
        let output = context.call_process_event(0, Event::new());
        assert!(output.midi.is_empty());
        assert!(context.last_error().unwrap().contains("budget"));
    }

    #[test]
    fn led_requests_pass_through_with_brightness() {
        let script = r#"
            fn init(ctx) {}
            fn process_event(track, event) {
                led("saving");
            }
        "#;
        let mut context = ScriptContext::from_source(1, script).unwrap();
        let output = context.call_process_event(0, Event::new());
        assert_eq!(
            Some(LedRequest {
                pattern: LedPattern::Saving,
                brightness: 255
            }),
            output.led
        );
    }

    #[test]
    fn init_receives_the_context_record() {
        let script = r#"
            fn init(ctx) {
                if ctx.tempo <= 0 { throw "bad tempo"; }
                if ctx.midi_channel != 4 { throw "bad channel"; }
            }
            fn process_event(track, event) {}
        "#;
        let mut context = ScriptContext::from_source(4, script).unwrap();
        assert!(context.call_init());
        assert!(context.last_error().is_none());
    }

    #[test]
    fn loader_maps_numbered_files_onto_modes() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["01_keys.rhai", "07_bass.rhai", "notes.txt", "99_junk.rhai"] {
            let mut file = fs::File::create(dir.path().join(name)).unwrap();
            file.write_all(VOICE_SCRIPT.as_bytes()).unwrap();
        }
        let mut loader = ModeLoader::new(dir.path());
        assert_eq!(2, loader.load_all());
        assert!(loader.context(1).is_some());
        assert!(loader.context(7).is_some());
        assert!(loader.context(2).is_none());
        assert_eq!(2, loader.loaded_count());
    }

    #[test]
    fn loader_survives_a_broken_script() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("01_keys.rhai"), VOICE_SCRIPT).unwrap();
        fs::write(dir.path().join("02_broken.rhai"), "fn init( {").unwrap();
        let mut loader = ModeLoader::new(dir.path());
        assert_eq!(1, loader.load_all());
        assert!(loader.context(1).is_some());
        assert!(loader.context(2).is_none());
    }

    #[test]
    fn reload_recreates_a_context_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("03_voice.rhai");
        fs::write(&path, VOICE_SCRIPT).unwrap();
        let mut loader = ModeLoader::new(dir.path());
        loader.load_all();
        assert_eq!(Some("Test Voice"), loader.context(3).unwrap().mode_name());

        fs::write(
            &path,
            VOICE_SCRIPT.replace("\"Test Voice\"", "\"Renamed\""),
        )
        .unwrap();
        assert!(loader.reload_mode(3));
        assert_eq!(Some("Renamed"), loader.context(3).unwrap().mode_name());
    }

    #[test]
    fn loader_rejects_out_of_range_modes() {
        let mut loader = ModeLoader::new("does-not-matter");
        assert!(!loader.load_mode_source(NUM_MODES, VOICE_SCRIPT));
        assert!(!loader.reload_mode(NUM_MODES));
        assert!(loader.context(NUM_MODES).is_none());
    }
}
