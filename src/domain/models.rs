use std::fmt;
use std::time::SystemTime;

/// A peripheral found by the scanner. Immutable once obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralIdentity {
    /// Opaque transport address
    pub address: String,
    /// Advertised local name
    pub name: String,
}

impl PeripheralIdentity {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// A decoded temperature with its time of receipt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureReading {
    pub celsius: f64,
    pub received_at: SystemTime,
}

impl TemperatureReading {
    pub fn new(celsius: f64) -> Self {
        Self {
            celsius,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Subscribing,
    Ready,
    Disconnected,
}

impl ConnectionState {
    /// States in which a connection handle is held.
    pub fn holds_connection(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::DiscoveringServices | Self::Subscribing | Self::Ready
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Scanning => "Scanning",
            Self::Connecting => "Connecting",
            Self::DiscoveringServices => "Discovering services",
            Self::Subscribing => "Subscribing",
            Self::Ready => "Ready",
            Self::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Events pushed to the display collaborator
#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionState(ConnectionState),
    Reading(TemperatureReading),
    PeripheralName(String),
    BringToFront,
    LogMessage(StatusMessage),
}

/// Commands accepted from the display collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCommand {
    /// User asked to reconnect
    RequestConnect,
    /// Overlay widget was tapped
    BringToFront,
    /// Host went to the background
    Suspend,
    /// Host came back to the foreground
    Resume,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
