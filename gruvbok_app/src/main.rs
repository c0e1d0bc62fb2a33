//! Headless desktop host for the gruvbok sequencer core.
//!
//! The engine runs on its own drive thread at a ~1ms tick (script contexts
//! are not `Send`, so the engine is built on that thread). The main thread
//! reads simple line commands from stdin and forwards them as intents.

mod peripherals;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};

use gruvbok_sequencer::engine::{Engine, Intent, IntentSender};
use peripherals::DesktopHardware;

#[derive(Debug, Parser)]
#[command(name = "gruvbok", about = "always-playing groovebox sequencer")]
struct Args {
    /// Directory of NN_*.rhai mode scripts
    #[arg(long, default_value = "modes")]
    modes: PathBuf,

    /// Song file to load on start and autosave to
    #[arg(long)]
    song: Option<PathBuf>,

    /// Substring of the MIDI output port name to connect to
    #[arg(long)]
    port: Option<String>,

    /// List MIDI output ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Initial tempo in BPM (overridden by a loaded song)
    #[arg(long, default_value_t = 120)]
    tempo: i32,

    /// Start from the factory demo pattern set
    #[arg(long)]
    demo: bool,

    /// Seconds between autosaves of a dirty song (0 disables)
    #[arg(long, default_value_t = 30)]
    autosave_secs: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_ports {
        for name in DesktopHardware::list_ports()? {
            println!("{name}");
        }
        return Ok(());
    }

    let quit = Arc::new(AtomicBool::new(false));
    let song_path = args.song.clone();
    let (ready_tx, ready_rx) = mpsc::channel();

    let drive = {
        let quit = Arc::clone(&quit);
        thread::Builder::new()
            .name("gruvbok-drive".to_string())
            .spawn(move || drive_loop(args, ready_tx, quit))
            .context("could not spawn drive thread")?
    };

    let intents: IntentSender = ready_rx.recv().context("drive thread died during setup")??;
    info!("[app] ready; commands: start stop continue tempo <bpm> save demo quit");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.unwrap_or_default();
        let mut words = line.split_whitespace();
        match words.next() {
            Some("start") => drop(intents.send(Intent::Start)),
            Some("stop") => drop(intents.send(Intent::Stop)),
            Some("continue") => drop(intents.send(Intent::Continue)),
            Some("demo") => drop(intents.send(Intent::LoadDemoContent)),
            Some("tempo") => match words.next().and_then(|w| w.parse().ok()) {
                Some(bpm) => drop(intents.send(Intent::SetTempo(bpm))),
                None => warn!("[app] usage: tempo <bpm>"),
            },
            Some("save") => match &song_path {
                Some(path) => drop(intents.send(Intent::SaveSong(path.clone()))),
                None => warn!("[app] no --song path configured"),
            },
            Some("quit") => break,
            Some(other) => warn!("[app] unknown command '{other}'"),
            None => {}
        }
    }

    quit.store(true, Ordering::Relaxed);
    drive.join().ok();
    Ok(())
}

type Ready = anyhow::Result<IntentSender>;

fn drive_loop(args: Args, ready_tx: mpsc::Sender<Ready>, quit: Arc<AtomicBool>) {
    let hardware = match DesktopHardware::connect(args.port.as_deref()) {
        Ok(hardware) => hardware,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut engine = Engine::new(hardware, &args.modes);
    let loaded = engine.load_mode_scripts();
    if loaded == 0 {
        warn!(
            "[app] no mode scripts loaded from {}; the box will play silence",
            args.modes.display()
        );
    }

    engine.set_tempo(args.tempo);
    if let Some(song) = &args.song {
        if song.exists() {
            if let Err(e) = engine.load_song(song) {
                error!("[app] {e}");
            }
        }
    }
    if args.demo {
        engine.load_demo_content();
    }

    if ready_tx.send(Ok(engine.intent_sender())).is_err() {
        return;
    }

    engine.start();

    let autosave = Duration::from_secs(args.autosave_secs.max(1));
    let mut last_autosave = Instant::now();
    while !quit.load(Ordering::Relaxed) {
        engine.update();

        if args.autosave_secs > 0 && last_autosave.elapsed() >= autosave {
            last_autosave = Instant::now();
            if engine.is_dirty() {
                if let Some(song) = &args.song {
                    if let Err(e) = engine.save_song(song) {
                        error!("[app] autosave failed: {e}");
                    }
                }
            }
        }

        thread::sleep(Duration::from_millis(1));
    }

    engine.shutdown();
    info!("[app] goodbye");
}
