//! Runtime toggles received on the control channel.
//!
//! One JSON object per line: `{"command": "...", "value": bool}`. Lines that
//! do not parse, or name an unknown command, are dropped.

use serde::Deserialize;
use std::io::BufRead;
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    ShowOverlays(bool),
    ThreatDetection(bool),
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    command: String,
    value: Option<bool>,
}

/// Parse one control line. A missing `value` falls back to the toggle's
/// default: overlays off, threat detection on.
pub fn parse_command(line: &str) -> Option<Command> {
    let raw: RawCommand = serde_json::from_str(line.trim()).ok()?;
    match raw.command.as_str() {
        "toggle_overlays" => Some(Command::ShowOverlays(raw.value.unwrap_or(false))),
        "set_weapon_detection" => Some(Command::ThreatDetection(raw.value.unwrap_or(true))),
        _ => None,
    }
}

/// Advisory flags owned by the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Toggles {
    pub show_overlays: bool,
    pub threat_detection: bool,
}

impl Default for Toggles {
    fn default() -> Self {
        Self {
            show_overlays: false,
            threat_detection: true,
        }
    }
}

impl Toggles {
    pub fn apply(&mut self, command: Command) {
        match command {
            Command::ShowOverlays(on) => self.show_overlays = on,
            Command::ThreatDetection(on) => self.threat_detection = on,
        }
    }
}

/// Read commands from `reader` until EOF or until the receiving side hangs
/// up.
pub fn spawn_listener<R>(reader: R, commands: Sender<Command>) -> JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    std::thread::spawn(move || {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    log::warn!("command: read failed: {}", err);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Some(command) => {
                    log::info!("command: {:?}", command);
                    if commands.send(command).is_err() {
                        break;
                    }
                }
                None => log::debug!("command: ignoring {:?}", line),
            }
        }
        log::info!("command: listener stopped");
    })
}
