//! Bluetooth Service Module
//!
//! Keeps the thermometer connected: scan, connect, and scan again whenever
//! the link drops or a scan window elapses. All transport events and UI
//! commands are processed on the one task running [`SensorService::run`].

use crate::domain::models::{
    AppEvent, ConnectionState, MessageSeverity, SensorCommand, StatusMessage, TemperatureReading,
};
use crate::domain::settings::Settings;
use crate::error::SensorError;
use crate::infrastructure::bluetooth::{
    connection::{ConnectionManager, LinkUpdate},
    scanner::{BleScanner, ScanOutcome},
    transport::{BleEvent, EventReceiver, EventSender, Transport, TransportEvent},
};
use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Orchestrates scan sessions and the connection manager
pub struct SensorService<T: Transport> {
    transport: T,
    scanner: BleScanner,
    connection: ConnectionManager,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    state: ConnectionState,
    latest_reading: Option<TemperatureReading>,
    suspended: bool,
    shutting_down: bool,
}

impl<T: Transport> SensorService<T> {
    /// `ble_sender` must feed the receiver later passed to [`Self::run`].
    pub fn new(
        transport: T,
        settings: &Settings,
        ble_sender: EventSender,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<Self> {
        let scanner = BleScanner::new(settings.scan_filter()?, settings.scan_timeout(), ble_sender);
        let connection = ConnectionManager::new(settings.target_profile()?, settings.decoder());

        Ok(Self {
            transport,
            scanner,
            connection,
            event_sender,
            state: ConnectionState::Idle,
            latest_reading: None,
            suspended: false,
            shutting_down: false,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn latest_reading(&self) -> Option<&TemperatureReading> {
        self.latest_reading.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run until shutdown is requested or the command channel closes
    pub async fn run(
        mut self,
        mut ble_events: EventReceiver,
        mut commands: mpsc::UnboundedReceiver<SensorCommand>,
    ) -> Result<()> {
        info!("Sensor service started");
        self.start_scan();

        loop {
            tokio::select! {
                Some(event) = ble_events.recv() => self.handle_event(event),
                command = commands.recv() => match command {
                    Some(SensorCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }

        self.shutdown();
        info!("Sensor service stopped");
        Ok(())
    }

    pub fn handle_command(&mut self, command: SensorCommand) {
        debug!("Command: {:?}", command);
        match command {
            SensorCommand::RequestConnect => {
                if self.scanner.is_scanning() || self.connection.is_active() {
                    info!("Ignoring connect request while {}", self.state);
                } else {
                    self.start_scan();
                }
            }
            SensorCommand::BringToFront => {
                let _ = self.event_sender.send(AppEvent::BringToFront);
            }
            SensorCommand::Suspend => {
                self.suspended = true;
                if self.scanner.is_scanning() {
                    self.scanner.stop(&mut self.transport);
                    self.publish_state(ConnectionState::Idle);
                }
            }
            SensorCommand::Resume => {
                self.suspended = false;
                if !self.scanner.is_scanning() && !self.connection.is_active() {
                    self.start_scan();
                }
            }
            SensorCommand::Shutdown => self.shutdown(),
        }
    }

    pub fn handle_event(&mut self, event: BleEvent) {
        match event {
            BleEvent::ScanTimeout { session } => {
                if let Some(outcome) = self.scanner.handle_timeout(&mut self.transport, session) {
                    self.on_scan_outcome(outcome);
                }
            }
            BleEvent::Transport(TransportEvent::ScanResult(advertisement)) => {
                if let Some(outcome) = self
                    .scanner
                    .handle_advertisement(&mut self.transport, &advertisement)
                {
                    self.on_scan_outcome(outcome);
                }
            }
            BleEvent::Transport(TransportEvent::ScanFailed(reason)) => {
                if let Some(outcome) = self.scanner.handle_failure(&mut self.transport, &reason) {
                    self.on_scan_outcome(outcome);
                }
            }
            BleEvent::Transport(event) => {
                let updates = self.connection.handle_event(&mut self.transport, &event);
                self.apply(updates);
            }
        }
    }

    fn on_scan_outcome(&mut self, outcome: ScanOutcome) {
        match outcome {
            ScanOutcome::Matched(peripheral) => {
                self.send_log(
                    &format!("Connect to {}", peripheral),
                    MessageSeverity::Info,
                );
                match self.connection.connect(&mut self.transport, &peripheral) {
                    Ok(updates) => self.apply(updates),
                    Err(e) => {
                        error!("Cannot connect to {}: {}", peripheral, e);
                        self.publish_state(ConnectionState::Idle);
                    }
                }
            }
            ScanOutcome::TimedOut => {
                // Sensor may be off or out of range; keep looking
                let reason = SensorError::ScanTimedOut(self.scanner.timeout());
                self.send_log(&reason.to_string(), MessageSeverity::Info);
                self.start_scan();
            }
            ScanOutcome::Failed(e) => {
                error!("{}", e);
                self.send_log(&e.to_string(), MessageSeverity::Error);
                self.publish_state(ConnectionState::Idle);
            }
        }
    }

    fn apply(&mut self, updates: Vec<LinkUpdate>) {
        for update in updates {
            match update {
                LinkUpdate::State(state) => self.publish_state(state),
                LinkUpdate::Connected(peripheral) => {
                    let _ = self
                        .event_sender
                        .send(AppEvent::PeripheralName(peripheral.name.clone()));
                    self.send_log(
                        &format!("Connected to {}", peripheral.name),
                        MessageSeverity::Success,
                    );
                }
                LinkUpdate::Reading(reading) => {
                    self.latest_reading = Some(reading);
                    let _ = self.event_sender.send(AppEvent::Reading(reading));
                }
                LinkUpdate::DecodeFailed(e) => {
                    self.send_log(&e.to_string(), MessageSeverity::Warning);
                }
                LinkUpdate::Closed(reason) => self.on_link_closed(reason),
            }
        }
    }

    fn on_link_closed(&mut self, reason: SensorError) {
        match reason {
            SensorError::Disconnected { requested: true } => {
                self.send_log("Disconnected from device", MessageSeverity::Info);
            }
            ref other => {
                warn!("Link closed: {}", other);
                self.send_log(&other.to_string(), MessageSeverity::Warning);
            }
        }

        if self.shutting_down || self.suspended {
            return;
        }
        self.start_scan();
    }

    fn start_scan(&mut self) {
        match self.scanner.start(&mut self.transport) {
            Ok(_) => {
                self.publish_state(ConnectionState::Scanning);
            }
            Err(SensorError::ScanAlreadyActive) => {
                debug!("Scan already running");
            }
            Err(e) => {
                // Reported once; the user has to fix it and ask again
                error!("Cannot start scan: {}", e);
                self.send_log(&e.to_string(), MessageSeverity::Error);
                self.publish_state(ConnectionState::Idle);
            }
        }
    }

    fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.scanner.stop(&mut self.transport);
        let updates = self.connection.shutdown(&mut self.transport);
        self.apply(updates);
        self.publish_state(ConnectionState::Idle);
    }

    fn publish_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!("Connection state: {} -> {}", self.state, state);
        self.state = state;
        let _ = self.event_sender.send(AppEvent::ConnectionState(state));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
