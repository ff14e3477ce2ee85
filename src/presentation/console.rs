//! Terminal display for the thermometer
//!
//! Renders the events pushed by the sensor service and turns typed lines
//! into commands.

use crate::domain::models::{
    AppEvent, ConnectionState, MessageSeverity, SensorCommand, TemperatureReading,
};
use std::io::BufRead;
use tokio::sync::mpsc;
use tracing::debug;

const NO_DEVICE: &str = "No device";

pub const HELP: &str =
    "Commands: c = connect, f = bring to front, p = pause, r = resume, q = quit";

pub struct ConsoleDisplay {
    state: ConnectionState,
    device_name: Option<String>,
    reading: Option<TemperatureReading>,
}

impl Default for ConsoleDisplay {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            device_name: None,
            reading: None,
        }
    }
}

impl ConsoleDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event and return the lines to print
    pub fn handle(&mut self, event: AppEvent) -> Vec<String> {
        match event {
            AppEvent::ConnectionState(state) => {
                self.state = state;
                if !state.holds_connection() {
                    self.device_name = None;
                    self.reading = None;
                }
                vec![format!("[{}] {}", state, self.device_label())]
            }
            AppEvent::PeripheralName(name) => {
                self.device_name = Some(name);
                vec![format!("Device: {}", self.device_label())]
            }
            AppEvent::Reading(reading) => {
                self.reading = Some(reading);
                vec![format!("Temperature: {} °C", format_celsius(reading.celsius))]
            }
            AppEvent::BringToFront => self.render_panel(),
            AppEvent::LogMessage(message) => {
                let tag = match message.severity {
                    MessageSeverity::Info => "info",
                    MessageSeverity::Success => "ok",
                    MessageSeverity::Warning => "warn",
                    MessageSeverity::Error => "error",
                };
                vec![format!("({}) {}", tag, message.message)]
            }
        }
    }

    /// Full status panel
    pub fn render_panel(&self) -> Vec<String> {
        let temperature = match (&self.reading, self.state) {
            (Some(reading), ConnectionState::Ready) => {
                format!("{} °C", format_celsius(reading.celsius))
            }
            _ => "--.- °C".to_string(),
        };
        vec![
            "==============================".to_string(),
            format!(" Device:      {}", self.device_label()),
            format!(" State:       {}", self.state),
            format!(" Temperature: {}", temperature),
            "==============================".to_string(),
        ]
    }

    fn device_label(&self) -> &str {
        self.device_name.as_deref().unwrap_or(NO_DEVICE)
    }
}

/// One decimal, right-aligned to four columns
pub fn format_celsius(celsius: f64) -> String {
    format!("{:4.1}", celsius)
}

pub fn parse_command(line: &str) -> Option<SensorCommand> {
    match line.trim().to_lowercase().as_str() {
        "c" | "connect" => Some(SensorCommand::RequestConnect),
        "f" | "front" => Some(SensorCommand::BringToFront),
        "p" | "pause" => Some(SensorCommand::Suspend),
        "r" | "resume" => Some(SensorCommand::Resume),
        "q" | "quit" | "exit" => Some(SensorCommand::Shutdown),
        _ => None,
    }
}

/// Print events until the service drops its sender
pub async fn run_display(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    let mut display = ConsoleDisplay::new();
    for line in display.render_panel() {
        println!("{}", line);
    }
    while let Some(event) = events.recv().await {
        for line in display.handle(event) {
            println!("{}", line);
        }
    }
}

/// Forward stdin lines as commands until EOF or quit. Blocks; run it on its own thread.
pub fn read_commands(commands: mpsc::UnboundedSender<SensorCommand>) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        match parse_command(&line) {
            Some(command) => {
                if commands.send(command).is_err() || command == SensorCommand::Shutdown {
                    break;
                }
            }
            None if line.trim().is_empty() => {}
            None => {
                debug!("Unknown command '{}'", line.trim());
                println!("{}", HELP);
            }
        }
    }
}
