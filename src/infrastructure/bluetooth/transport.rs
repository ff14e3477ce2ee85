//! BLE Transport Seam
//!
//! Commands issued through [`Transport`] never block. Their outcomes arrive
//! later as [`TransportEvent`]s on the single queue consumed by the
//! orchestrator, so every state transition happens on one task.

use crate::domain::models::PeripheralIdentity;
use crate::error::SensorError;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies one transport session. Never reused within a process.
pub type LinkId = u64;

/// Identifies one scan window
pub type ScanSessionId = u64;

/// One live transport session to one peripheral.
///
/// Not `Clone`: the connection manager is the only owner and must hand it
/// back through [`Transport::close`] to free the transport's slot.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionHandle {
    link: LinkId,
    peripheral: PeripheralIdentity,
}

impl ConnectionHandle {
    pub fn new(link: LinkId, peripheral: PeripheralIdentity) -> Self {
        Self { link, peripheral }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn peripheral(&self) -> &PeripheralIdentity {
        &self.peripheral
    }
}

/// Advertisement report seen while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub identity: PeripheralIdentity,
    pub service_uuids: Vec<Uuid>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn has_descriptor(&self, uuid: &Uuid) -> bool {
        self.descriptors.contains(uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure(String),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Link-layer state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ScanResult(Advertisement),
    ScanFailed(String),
    ConnectionStateChanged {
        link: LinkId,
        status: GattStatus,
        state: LinkState,
    },
    ServicesDiscovered {
        link: LinkId,
        status: GattStatus,
        services: Vec<GattService>,
    },
    DescriptorWritten {
        link: LinkId,
        status: GattStatus,
    },
    /// Local notification registration was refused after `set_notifications`
    NotificationsFailed {
        link: LinkId,
        reason: String,
    },
    CharacteristicChanged {
        link: LinkId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Everything that flows through the orchestrator's queue
#[derive(Debug, Clone, PartialEq)]
pub enum BleEvent {
    Transport(TransportEvent),
    /// A scan window elapsed. Stale sessions are ignored.
    ScanTimeout { session: ScanSessionId },
}

impl From<TransportEvent> for BleEvent {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

pub type EventSender = mpsc::UnboundedSender<BleEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BleEvent>;

/// Central-role operations needed to find, connect and subscribe to one peripheral.
pub trait Transport {
    fn is_radio_enabled(&self) -> bool;

    fn has_scan_permission(&self) -> bool;

    /// Start reporting advertisements. `services` is a hint for hardware filtering.
    fn start_scan(&mut self, services: &[Uuid]) -> Result<(), SensorError>;

    fn stop_scan(&mut self);

    /// Open a session. Completion is reported by `ConnectionStateChanged`.
    fn connect(&mut self, peripheral: &PeripheralIdentity)
        -> Result<ConnectionHandle, SensorError>;

    /// Enumerate services. Completion is reported by `ServicesDiscovered`.
    fn discover_services(&mut self, handle: &ConnectionHandle) -> Result<(), SensorError>;

    /// Register local interest in value changes of `characteristic`.
    fn set_notifications(
        &mut self,
        handle: &ConnectionHandle,
        characteristic: &GattCharacteristic,
        enable: bool,
    ) -> Result<(), SensorError>;

    /// Write a descriptor. Completion is reported by `DescriptorWritten`.
    fn write_descriptor(
        &mut self,
        handle: &ConnectionHandle,
        characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), SensorError>;

    /// Ask the peer to drop the link. Completion is reported by `ConnectionStateChanged`.
    fn disconnect(&mut self, handle: &ConnectionHandle);

    /// Release the session and everything registered on it.
    fn close(&mut self, handle: ConnectionHandle);
}
