//! Pen Clicks Library
//!
//! Counts the mechanical clicks of an injectable dosing pen by listening to
//! the microphone, and converts the count into a dose.

pub mod audio;
pub mod detection;
pub mod dose;
pub mod events;
pub mod session;
pub mod state;
pub mod store;

pub use session::{CancelToken, SessionController, SessionError, TickOutcome};
pub use state::{DetectionMode, SessionState, SessionStatus, Settings};

use audio::MicrophoneSource;
use detection::{MIN_SIGNATURE_SAMPLES, TARGET_CALIBRATION_SAMPLES};
use dose::PenProfile;
use events::{ChannelSink, SessionEvent};
use store::{DoseHistory, JsonStore};

use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Controller shared between the CLI and its polling task
pub type SharedController = Arc<Mutex<SessionController>>;

/// How often the CLI drains session events
const EVENT_PUMP_INTERVAL: Duration = Duration::from_millis(50);

const DEFAULT_STORE_FILE: &str = ".pen-clicks.json";

/// Count dosing-pen clicks from the microphone
#[derive(Parser, Debug)]
#[command(name = "pen-clicks")]
#[command(about = "Count dosing-pen clicks from the microphone and convert them into a dose")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// detection mode: simple or advanced (saved)
    #[arg(long, global = true)]
    mode: Option<DetectionMode>,

    /// spike threshold, clamped to 0.05-0.4 (saved)
    #[arg(long, global = true)]
    sensitivity: Option<f32>,

    /// input device name (saved)
    #[arg(long, global = true)]
    device: Option<String>,

    /// settings and history file (default: ~/.pen-clicks.json)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// count clicks until Ctrl+C (default)
    Listen {
        /// save the count as a dose on exit
        #[arg(long)]
        save: bool,
    },
    /// record clicks and build a click signature
    Calibrate {
        /// clicks to record
        #[arg(long, default_value_t = TARGET_CALIBRATION_SAMPLES, value_parser = parse_target)]
        target: usize,
    },
    /// list input devices
    Devices,
    /// forget the stored click signature
    ClearSignature,
    /// show saved doses
    History,
}

impl Cli {
    fn action(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Listen { save: false })
    }

    fn store_path(&self) -> PathBuf {
        self.store.clone().unwrap_or_else(default_store_path)
    }
}

fn parse_target(value: &str) -> Result<usize, String> {
    let target: usize = value
        .parse()
        .map_err(|_| format!("invalid click count: {}", value))?;
    if target < MIN_SIGNATURE_SAMPLES {
        return Err(format!("must be at least {}", MIN_SIGNATURE_SAMPLES));
    }
    Ok(target)
}

fn default_store_path() -> PathBuf {
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(DEFAULT_STORE_FILE),
        None => PathBuf::from(DEFAULT_STORE_FILE),
    }
}

/// Command-line entry point
pub fn run() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = execute(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn execute(cli: Cli) -> Result<(), String> {
    let command = cli.action();
    match command {
        Command::Devices => return list_devices(),
        Command::History => return show_history(&cli.store_path()),
        _ => {}
    }

    let store = JsonStore::open(cli.store_path());
    let (sink, events) = ChannelSink::new();
    let mut controller =
        SessionController::new(Box::new(MicrophoneSource::new()), Box::new(store))
            .with_sink(Box::new(sink));

    if cli.mode.is_some() || cli.sensitivity.is_some() || cli.device.is_some() {
        let mut settings = controller.settings().clone();
        if let Some(mode) = cli.mode {
            settings.mode = mode;
        }
        if let Some(sensitivity) = cli.sensitivity {
            settings = settings.with_sensitivity(sensitivity);
        }
        if cli.device.is_some() {
            settings.device = cli.device.clone();
        }
        controller.update_settings(settings).map_err(|e| e.to_string())?;
    }

    if command == Command::ClearSignature {
        controller.clear_signature().map_err(|e| e.to_string())?;
        println!("Click signature cleared");
        return Ok(());
    }

    let controller: SharedController = Arc::new(Mutex::new(controller));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| e.to_string())?;

    match command {
        Command::Calibrate { target } => runtime.block_on(calibrate(controller, events, target)),
        Command::Listen { save } => runtime.block_on(listen(controller, events, save)),
        Command::Devices | Command::History | Command::ClearSignature => Ok(()),
    }
}

fn list_devices() -> Result<(), String> {
    let devices = audio::list_input_devices().map_err(|e| e.to_string())?;
    if devices.is_empty() {
        println!("No input devices found");
    }
    for device in devices {
        let marker = if device.is_default { "*" } else { " " };
        println!("{} {}", marker, device.name);
    }
    Ok(())
}

fn show_history(path: &Path) -> Result<(), String> {
    let store = JsonStore::open(path);
    let entries = store.dose_entries().map_err(|e| e.to_string())?;
    if entries.is_empty() {
        println!("No saved doses");
    }
    for entry in entries {
        println!(
            "{}  {:>3} clicks  {:>6.2} mg  ({})",
            entry.recorded_at, entry.clicks, entry.mg, entry.mode
        );
    }
    Ok(())
}

/// How an event pump ended
#[derive(Debug, PartialEq, Eq)]
enum PumpEnd {
    Done,
    Interrupted,
}

/// Drain session events until `on_event` returns true or Ctrl+C arrives
async fn pump_events<F>(events: &mpsc::Receiver<SessionEvent>, mut on_event: F) -> PumpEnd
where
    F: FnMut(&SessionEvent) -> bool,
{
    let mut interval = tokio::time::interval(EVENT_PUMP_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                return PumpEnd::Interrupted;
            }
            _ = interval.tick() => {
                for event in events.try_iter() {
                    if on_event(&event) {
                        return PumpEnd::Done;
                    }
                }
            }
        }
    }
}

async fn listen(
    controller: SharedController,
    events: mpsc::Receiver<SessionEvent>,
    save: bool,
) -> Result<(), String> {
    let (token, pen) = {
        let mut c = controller.lock();
        let token = c.start_listening().map_err(|e| e.to_string())?;
        (token, c.settings().pen.clone())
    };
    let poller = tokio::spawn(session::run_polling(controller.clone(), token));

    println!("Listening for {} clicks, press Ctrl+C to stop", pen.name);
    pump_events(&events, |event| {
        print_event(event, &pen);
        matches!(event, SessionEvent::Error { .. })
    })
    .await;

    let result = {
        let mut c = controller.lock();
        if c.state() != SessionState::Listening {
            Err("capture lost, clicks were not saved".to_string())
        } else if save {
            match c.stop_and_save() {
                Ok(record) => Ok(record.clicks),
                Err(e) => {
                    // The failed save left the session running
                    let clicks = c.stop().unwrap_or_default();
                    Err(format!("{} ({} clicks not saved)", e, clicks))
                }
            }
        } else {
            c.stop().map_err(|e| e.to_string())
        }
    };
    if let Err(e) = poller.await {
        log::error!("Polling task failed: {}", e);
    }

    for event in events.try_iter() {
        print_event(&event, &pen);
    }
    let clicks = result?;
    println!("Total: {} clicks = {:.2} mg", clicks, pen.dose_mg(clicks));
    Ok(())
}

async fn calibrate(
    controller: SharedController,
    events: mpsc::Receiver<SessionEvent>,
    target: usize,
) -> Result<(), String> {
    let token = controller
        .lock()
        .start_calibration()
        .map_err(|e| e.to_string())?;
    let poller = tokio::spawn(session::run_polling(controller.clone(), token));

    println!("Click your pen {} times, press Ctrl+C to abort", target);
    let mut recorded = 0;
    let end = pump_events(&events, |event| match event {
        SessionEvent::CalibrationSample(_) => {
            recorded += 1;
            println!("Recorded click {}/{}", recorded, target);
            recorded >= target
        }
        SessionEvent::Error { kind, message } => {
            eprintln!("Error ({}): {}", kind, message);
            true
        }
        _ => false,
    })
    .await;

    let result = {
        let mut c = controller.lock();
        if c.state() != SessionState::Calibrating {
            Err("capture lost, calibration discarded".to_string())
        } else {
            let outcome = match end {
                PumpEnd::Done => c.finish_calibration().map(Some),
                PumpEnd::Interrupted => c.cancel_calibration().map(|_| None),
            };
            outcome.map_err(|e| {
                // The failed save left calibration running
                let _ = c.cancel_calibration();
                e.to_string()
            })
        }
    };
    if let Err(e) = poller.await {
        log::error!("Polling task failed: {}", e);
    }

    match result? {
        Some(Some(signature)) => {
            println!("Signature saved from {} clicks", signature.sample_count)
        }
        Some(None) => println!(
            "Not enough clicks recorded (need {}), no signature saved",
            MIN_SIGNATURE_SAMPLES
        ),
        None => println!("Calibration cancelled"),
    }
    Ok(())
}

fn print_event(event: &SessionEvent, pen: &PenProfile) {
    match event {
        SessionEvent::Click { count, .. } => {
            println!("Click {} ({:.2} mg)", count, pen.dose_mg(*count))
        }
        SessionEvent::CalibrationSample(sample) => {
            println!("Calibration click (energy {:.3})", sample.energy)
        }
        SessionEvent::SignatureReady(signature) => {
            println!("Signature ready from {} clicks", signature.sample_count)
        }
        SessionEvent::DoseSaved(record) => {
            println!("Saved dose: {} clicks = {:.2} mg", record.clicks, record.mg)
        }
        SessionEvent::Error { kind, message } => eprintln!("Error ({}): {}", kind, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(list: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("pen-clicks").chain(list.iter().copied()))
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_arguments_means_listen_with_stored_settings() {
        let cli = parse(&[]).unwrap();

        assert_eq!(cli.action(), Command::Listen { save: false });
        assert!(cli.mode.is_none());
        assert!(cli.sensitivity.is_none());
        assert!(cli.device.is_none());
        assert_eq!(cli.store_path(), default_store_path());
    }

    #[test]
    fn parses_command_and_options() {
        let cli = parse(&[
            "listen",
            "--mode",
            "advanced",
            "--sensitivity",
            "0.2",
            "--store",
            "/tmp/pen.json",
            "--device",
            "USB Mic",
            "--save",
        ])
        .unwrap();

        assert_eq!(cli.action(), Command::Listen { save: true });
        assert_eq!(cli.mode, Some(DetectionMode::Advanced));
        assert_eq!(cli.sensitivity, Some(0.2));
        assert_eq!(cli.store_path(), PathBuf::from("/tmp/pen.json"));
        assert_eq!(cli.device.as_deref(), Some("USB Mic"));
    }

    #[test]
    fn global_options_may_precede_the_command() {
        let cli = parse(&["--mode", "Simple", "calibrate", "--target", "6"]).unwrap();

        assert_eq!(cli.action(), Command::Calibrate { target: 6 });
        assert_eq!(cli.mode, Some(DetectionMode::Simple));
    }

    #[test]
    fn parses_other_commands() {
        let cmd = |name: &str| parse(&[name]).unwrap().action();

        assert_eq!(
            cmd("calibrate"),
            Command::Calibrate {
                target: TARGET_CALIBRATION_SAMPLES
            }
        );
        assert_eq!(cmd("devices"), Command::Devices);
        assert_eq!(cmd("clear-signature"), Command::ClearSignature);
        assert_eq!(cmd("history"), Command::History);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse(&["--mode"]).is_err());
        assert!(parse(&["--mode", "loud"]).is_err());
        assert!(parse(&["--sensitivity", "high"]).is_err());
        assert!(parse(&["calibrate", "--target", "2"]).is_err());
        assert!(parse(&["listen", "--target", "5"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }

    #[test]
    fn help_is_reported_as_display_help() {
        let err = parse(&["--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
