//! btleplug-backed transport
//!
//! Radio commands are queued to one worker task and executed in order, so a
//! stop followed by a restart can never be reordered and only one GATT
//! request is outstanding at a time. Outcomes are posted to the
//! orchestrator's queue as [`TransportEvent`]s.

use crate::domain::models::PeripheralIdentity;
use crate::error::SensorError;
use crate::infrastructure::bluetooth::protocol::{self, ENABLE_NOTIFICATION_VALUE};
use crate::infrastructure::bluetooth::transport::{
    Advertisement, ConnectionHandle, EventSender, GattCharacteristic, GattService, GattStatus,
    LinkId, LinkState, Transport, TransportEvent,
};
use anyhow::Result;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Descriptor, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[derive(Debug)]
enum RadioCommand {
    StartScan(Vec<Uuid>),
    StopScan,
    Connect {
        link: LinkId,
        peripheral: Peripheral,
    },
    DiscoverServices(LinkId),
    SetNotifications {
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    },
    WriteDescriptor {
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    Disconnect(LinkId),
    Close(LinkId),
    PeerDisconnected(PeripheralId),
}

/// Peripherals seen during the current scan, keyed by platform peripheral id.
///
/// The id is used rather than the MAC address because CoreBluetooth reports
/// an all-zero address for every device.
struct DiscoveredPeripherals<P> {
    entries: Mutex<HashMap<String, P>>,
}

impl<P> Default for DiscoveredPeripherals<P> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<P: Clone> DiscoveredPeripherals<P> {
    fn insert(&self, key: String, peripheral: P) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, peripheral);
        }
    }

    fn get(&self, key: &str) -> Option<P> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[derive(Default)]
struct Shared {
    scanning: AtomicBool,
    discovered: DiscoveredPeripherals<Peripheral>,
}

/// Transport over the first Bluetooth adapter reported by the OS
pub struct BtleplugTransport {
    adapter_present: bool,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<RadioCommand>,
    next_link: LinkId,
    tasks: Vec<JoinHandle<()>>,
}

impl BtleplugTransport {
    /// Must be called from within a tokio runtime
    pub async fn new(events: EventSender) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next();

        let shared = Arc::new(Shared::default());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        match adapter {
            Some(adapter) => {
                info!("Using Bluetooth adapter {:?}", adapter.adapter_info().await.ok());
                let central_events = adapter.events().await?;
                tasks.push(tokio::spawn(listen(
                    adapter.clone(),
                    central_events,
                    shared.clone(),
                    commands.clone(),
                    events.clone(),
                )));
                let worker = RadioWorker {
                    adapter,
                    links: HashMap::new(),
                    events,
                };
                tasks.push(tokio::spawn(worker.run(command_rx)));
            }
            None => warn!("No Bluetooth adapter found"),
        }

        Ok(Self {
            adapter_present: !tasks.is_empty(),
            shared,
            commands,
            next_link: 1,
            tasks,
        })
    }

    fn submit(&self, command: RadioCommand) -> Result<(), SensorError> {
        self.commands
            .send(command)
            .map_err(|_| SensorError::TransportConnectError("radio worker stopped".to_string()))
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Transport for BtleplugTransport {
    fn is_radio_enabled(&self) -> bool {
        self.adapter_present
    }

    fn has_scan_permission(&self) -> bool {
        // Desktop stacks grant access at the OS level; a refusal surfaces as ScanFailed
        true
    }

    fn start_scan(&mut self, services: &[Uuid]) -> Result<(), SensorError> {
        if !self.adapter_present {
            return Err(SensorError::RadioDisabled);
        }
        let stale = self.shared.discovered.len();
        if stale > 0 {
            debug!("Forgetting {} peripherals from the previous scan", stale);
        }
        self.shared.discovered.clear();
        self.shared.scanning.store(true, Ordering::SeqCst);
        self.submit(RadioCommand::StartScan(services.to_vec()))
            .map_err(|e| SensorError::ScanFailed(e.to_string()))
    }

    fn stop_scan(&mut self) {
        self.shared.scanning.store(false, Ordering::SeqCst);
        let _ = self.submit(RadioCommand::StopScan);
    }

    fn connect(
        &mut self,
        peripheral: &PeripheralIdentity,
    ) -> Result<ConnectionHandle, SensorError> {
        let Some(device) = self.shared.discovered.get(&peripheral.address) else {
            return Err(SensorError::TransportConnectError(format!(
                "{} was not seen by the adapter",
                peripheral
            )));
        };

        let link = self.next_link;
        self.next_link += 1;
        self.submit(RadioCommand::Connect {
            link,
            peripheral: device,
        })?;
        Ok(ConnectionHandle::new(link, peripheral.clone()))
    }

    fn discover_services(&mut self, handle: &ConnectionHandle) -> Result<(), SensorError> {
        self.submit(RadioCommand::DiscoverServices(handle.link()))
    }

    fn set_notifications(
        &mut self,
        handle: &ConnectionHandle,
        characteristic: &GattCharacteristic,
        enable: bool,
    ) -> Result<(), SensorError> {
        self.submit(RadioCommand::SetNotifications {
            link: handle.link(),
            service: characteristic.service_uuid,
            characteristic: characteristic.uuid,
            enable,
        })
        .map_err(|e| SensorError::NotificationSubscribeFailed(e.to_string()))
    }

    fn write_descriptor(
        &mut self,
        handle: &ConnectionHandle,
        characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), SensorError> {
        self.submit(RadioCommand::WriteDescriptor {
            link: handle.link(),
            service: characteristic.service_uuid,
            characteristic: characteristic.uuid,
            descriptor,
            value: value.to_vec(),
        })
    }

    fn disconnect(&mut self, handle: &ConnectionHandle) {
        let _ = self.submit(RadioCommand::Disconnect(handle.link()));
    }

    fn close(&mut self, handle: ConnectionHandle) {
        let _ = self.submit(RadioCommand::Close(handle.link()));
    }
}

/// Forward adapter events: advertisements while scanning, drops always
async fn listen(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<RadioCommand>,
    events: EventSender,
) {
    while let Some(event) = central_events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                if shared.scanning.load(Ordering::SeqCst) {
                    report_advertisement(&adapter, &shared, &events, &id).await;
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let _ = commands.send(RadioCommand::PeerDisconnected(id));
            }
            _ => {}
        }
    }
    debug!("Adapter event stream ended");
}

async fn report_advertisement(
    adapter: &Adapter,
    shared: &Shared,
    events: &EventSender,
    id: &PeripheralId,
) {
    let Ok(peripheral) = adapter.peripheral(id).await else {
        return;
    };
    let Ok(Some(props)) = peripheral.properties().await else {
        return;
    };

    let key = id.to_string();
    let identity = PeripheralIdentity::new(key.clone(), props.local_name.unwrap_or_default());
    trace!("Advertisement from {} ({:?} dBm)", identity, props.rssi);

    shared.discovered.insert(key, peripheral);

    let _ = events.send(
        TransportEvent::ScanResult(Advertisement {
            identity,
            service_uuids: props.services,
            rssi: props.rssi,
        })
        .into(),
    );
}

struct Link {
    peripheral: Peripheral,
    notifications: Option<JoinHandle<()>>,
}

struct RadioWorker {
    adapter: Adapter,
    links: HashMap<LinkId, Link>,
    events: EventSender,
}

impl RadioWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RadioCommand>) {
        while let Some(command) = commands.recv().await {
            trace!("Radio command: {:?}", command);
            self.execute(command).await;
        }
        for (_, link) in self.links.drain() {
            if let Some(task) = link.notifications {
                task.abort();
            }
            let _ = link.peripheral.disconnect().await;
        }
    }

    async fn execute(&mut self, command: RadioCommand) {
        match command {
            RadioCommand::StartScan(services) => {
                info!("Starting BLE scan for {:?}", services);
                if let Err(e) = self.adapter.start_scan(ScanFilter { services }).await {
                    error!("Failed to start scan: {}", e);
                    self.emit(TransportEvent::ScanFailed(e.to_string()));
                }
            }
            RadioCommand::StopScan => {
                if let Err(e) = self.adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            RadioCommand::Connect { link, peripheral } => {
                let outcome = peripheral.connect().await;
                self.links.insert(
                    link,
                    Link {
                        peripheral,
                        notifications: None,
                    },
                );
                let (status, state) = match outcome {
                    Ok(()) => (GattStatus::Success, LinkState::Connected),
                    Err(e) => (GattStatus::Failure(e.to_string()), LinkState::Disconnected),
                };
                self.emit(TransportEvent::ConnectionStateChanged {
                    link,
                    status,
                    state,
                });
            }
            RadioCommand::DiscoverServices(link) => {
                let Some(peripheral) = self.peripheral(link) else {
                    return;
                };
                let (status, services) = match peripheral.discover_services().await {
                    Ok(()) => (
                        GattStatus::Success,
                        peripheral.services().into_iter().map(convert_service).collect(),
                    ),
                    Err(e) => (GattStatus::Failure(e.to_string()), Vec::new()),
                };
                self.emit(TransportEvent::ServicesDiscovered {
                    link,
                    status,
                    services,
                });
            }
            RadioCommand::SetNotifications {
                link,
                service,
                characteristic,
                enable,
            } => self.set_notifications(link, service, characteristic, enable).await,
            RadioCommand::WriteDescriptor {
                link,
                service,
                characteristic,
                descriptor,
                value,
            } => {
                let Some(peripheral) = self.peripheral(link) else {
                    return;
                };
                let status =
                    match write_descriptor(&peripheral, service, characteristic, descriptor, &value)
                        .await
                    {
                        Ok(()) => GattStatus::Success,
                        Err(e) => GattStatus::Failure(e.to_string()),
                    };
                self.emit(TransportEvent::DescriptorWritten { link, status });
            }
            RadioCommand::Disconnect(link) => {
                let Some(peripheral) = self.peripheral(link) else {
                    return;
                };
                if let Err(e) = peripheral.disconnect().await {
                    warn!("Disconnect failed: {}", e);
                }
                self.emit(TransportEvent::ConnectionStateChanged {
                    link,
                    status: GattStatus::Success,
                    state: LinkState::Disconnected,
                });
            }
            RadioCommand::Close(link) => {
                if let Some(link) = self.links.remove(&link) {
                    if let Some(task) = link.notifications {
                        task.abort();
                    }
                    if link.peripheral.is_connected().await.unwrap_or(false) {
                        let _ = link.peripheral.disconnect().await;
                    }
                }
            }
            RadioCommand::PeerDisconnected(id) => {
                let dropped = self
                    .links
                    .iter()
                    .find(|(_, l)| l.peripheral.id() == id)
                    .map(|(link, _)| *link);
                if let Some(link) = dropped {
                    info!("Peer dropped link {}", link);
                    self.emit(TransportEvent::ConnectionStateChanged {
                        link,
                        status: GattStatus::Success,
                        state: LinkState::Disconnected,
                    });
                }
            }
        }
    }

    async fn set_notifications(
        &mut self,
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) {
        let Some(entry) = self.links.get_mut(&link) else {
            return;
        };
        if let Some(task) = entry.notifications.take() {
            task.abort();
        }

        let Some(target) = find_characteristic(&entry.peripheral, service, characteristic) else {
            self.emit(TransportEvent::NotificationsFailed {
                link,
                reason: format!("characteristic {} not found", characteristic),
            });
            return;
        };

        if !enable {
            if let Err(e) = entry.peripheral.unsubscribe(&target).await {
                warn!("Failed to unsubscribe from {}: {}", characteristic, e);
            }
            return;
        }

        // Open the stream before subscribing so the first notification is not lost
        let mut stream = match entry.peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Could not register for notifications: {}", e);
                self.emit(TransportEvent::NotificationsFailed {
                    link,
                    reason: e.to_string(),
                });
                return;
            }
        };
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == characteristic {
                    let _ = events.send(
                        TransportEvent::CharacteristicChanged {
                            link,
                            characteristic,
                            value: notification.value,
                        }
                        .into(),
                    );
                }
            }
        });

        match entry.peripheral.subscribe(&target).await {
            Ok(()) => {
                debug!("Subscribed to {} on link {}", characteristic, link);
                entry.notifications = Some(forwarder);
            }
            Err(e) => {
                error!("Could not subscribe to {}: {}", characteristic, e);
                forwarder.abort();
                self.emit(TransportEvent::NotificationsFailed {
                    link,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn peripheral(&self, link: LinkId) -> Option<Peripheral> {
        let peripheral = self.links.get(&link).map(|l| l.peripheral.clone());
        if peripheral.is_none() {
            debug!("Command for closed link {}", link);
        }
        peripheral
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event.into());
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    service: Uuid,
    characteristic: Uuid,
) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == characteristic && c.service_uuid == service)
}

/// True when the write only repeats what `subscribe` already did: the OS
/// stack owns the CCC descriptor and sets it on subscription.
fn ccc_write_is_implicit(descriptor: Uuid, value: &[u8]) -> bool {
    Uuid::parse_str(protocol::CCC_DESCRIPTOR_UUID).map_or(false, |ccc| ccc == descriptor)
        && value == ENABLE_NOTIFICATION_VALUE
}

async fn write_descriptor(
    peripheral: &Peripheral,
    service: Uuid,
    characteristic: Uuid,
    descriptor: Uuid,
    value: &[u8],
) -> Result<()> {
    if ccc_write_is_implicit(descriptor, value) {
        trace!("CCC already enabled by subscribe on {}", characteristic);
        return Ok(());
    }

    if find_characteristic(peripheral, service, characteristic).is_none() {
        return Err(anyhow::anyhow!("Characteristic {} not found", characteristic));
    }
    let descriptor = Descriptor {
        uuid: descriptor,
        service_uuid: service,
        characteristic_uuid: characteristic,
    };
    peripheral.write_descriptor(&descriptor, value).await?;
    Ok(())
}

fn convert_service(service: btleplug::api::Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .into_iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
                descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
            })
            .collect(),
    }
}
