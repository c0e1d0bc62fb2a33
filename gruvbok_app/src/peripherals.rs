//! Hardware port for the desktop build: MIDI out through `midir`, time from
//! a monotonic origin, the status LED mirrored into the log. The desktop
//! build has no control surface, so buttons and pots read as neutral and all
//! programming arrives through engine intents.

use std::time::Instant;

use anyhow::{anyhow, Context};
use log::{debug, trace, warn};
use midir::{MidiOutput, MidiOutputConnection};

use gruvbok_sequencer::hardware::Hardware;
use gruvbok_sequencer::midi::MidiMessage;

const CLIENT_NAME: &str = "gruvbok";

pub struct DesktopHardware {
    origin: Instant,
    connection: Option<MidiOutputConnection>,
    led: bool,
}

impl DesktopHardware {
    /// Connect to a MIDI output port whose name contains `filter`, or the
    /// first available port when no filter is given. With no ports at all
    /// the engine still runs; MIDI goes nowhere.
    pub fn connect(filter: Option<&str>) -> anyhow::Result<DesktopHardware> {
        let output = MidiOutput::new(CLIENT_NAME).context("could not create MIDI output")?;
        let ports = output.ports();

        let port = match filter {
            Some(filter) => Some(
                ports
                    .iter()
                    .find(|p| {
                        output
                            .port_name(p)
                            .map(|name| name.contains(filter))
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| anyhow!("no MIDI output port matches '{filter}'"))?,
            ),
            None => ports.first(),
        };

        let connection = match port {
            Some(port) => {
                let name = output
                    .port_name(port)
                    .unwrap_or_else(|_| "[unnamed]".to_string());
                let connection = output
                    .connect(port, "gruvbok-out")
                    .map_err(|e| anyhow!("could not connect to MIDI port {name}: {e}"))?;
                log::info!("[hardware] MIDI out -> {name}");
                Some(connection)
            }
            None => {
                warn!("[hardware] no MIDI output ports available, running silent");
                None
            }
        };

        Ok(DesktopHardware {
            origin: Instant::now(),
            connection,
            led: false,
        })
    }

    pub fn list_ports() -> anyhow::Result<Vec<String>> {
        let output = MidiOutput::new(CLIENT_NAME).context("could not create MIDI output")?;
        Ok(output
            .ports()
            .iter()
            .map(|p| {
                output
                    .port_name(p)
                    .unwrap_or_else(|_| "[unnamed]".to_string())
            })
            .collect())
    }
}

impl Hardware for DesktopHardware {
    fn init(&mut self) -> bool {
        true
    }

    fn shutdown(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }

    fn read_button(&self, _button: usize) -> bool {
        false
    }

    fn read_rotary_pot(&self, _pot: usize) -> u8 {
        0
    }

    fn read_slider_pot(&self, _pot: usize) -> u8 {
        0
    }

    fn send_midi(&mut self, message: MidiMessage) {
        match &mut self.connection {
            Some(connection) => {
                if let Err(e) = connection.send(message.bytes()) {
                    warn!("[hardware] MIDI send failed: {e}");
                }
            }
            None => trace!("[hardware] (silent) {:02X?}", message.bytes()),
        }
    }

    fn set_led(&mut self, on: bool) {
        if on != self.led {
            self.led = on;
            debug!("[hardware] led {}", if on { "on" } else { "off" });
        }
    }

    fn get_led(&self) -> bool {
        self.led
    }

    fn now_ms(&self) -> u32 {
        self.origin.elapsed().as_millis() as u32
    }

    fn update(&mut self) {}
}
