//! BLE Connection Module
//!
//! Drives one peripheral through connect, service discovery and notification
//! subscription, then routes notifications through the decoder.
//!
//! ```text
//! Idle -> Connecting -> DiscoveringServices -> Subscribing -> Ready
//!   \________________________\___________________\____________\__-> Disconnected
//! ```
//!
//! Reconnection is not handled here; the orchestrator decides what to do
//! after a [`LinkUpdate::Closed`].

use crate::domain::models::{ConnectionState, PeripheralIdentity, TemperatureReading};
use crate::error::SensorError;
use crate::infrastructure::bluetooth::protocol::{TemperatureDecoder, ENABLE_NOTIFICATION_VALUE};
use crate::infrastructure::bluetooth::transport::{
    ConnectionHandle, GattService, GattStatus, LinkState, Transport, TransportEvent,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The GATT profile the peripheral must expose
#[derive(Debug, Clone, PartialEq)]
pub struct TargetProfile {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub ccc_descriptor_uuid: Uuid,
}

/// Something the orchestrator needs to react to
#[derive(Debug, Clone, PartialEq)]
pub enum LinkUpdate {
    State(ConnectionState),
    Connected(PeripheralIdentity),
    Reading(TemperatureReading),
    DecodeFailed(SensorError),
    /// The link is gone and its handle released
    Closed(SensorError),
}

/// Connection manager for a single peripheral
pub struct ConnectionManager {
    profile: TargetProfile,
    decoder: TemperatureDecoder,
    state: ConnectionState,
    handle: Option<ConnectionHandle>,
    close_requested: bool,
}

impl ConnectionManager {
    pub fn new(profile: TargetProfile, decoder: TemperatureDecoder) -> Self {
        Self {
            profile,
            decoder,
            state: ConnectionState::Idle,
            handle: None,
            close_requested: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peripheral(&self) -> Option<&PeripheralIdentity> {
        self.handle.as_ref().map(|h| h.peripheral())
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Open a connection to `peripheral`
    pub fn connect<T: Transport>(
        &mut self,
        transport: &mut T,
        peripheral: &PeripheralIdentity,
    ) -> Result<Vec<LinkUpdate>, SensorError> {
        if self.handle.is_some() {
            return Err(SensorError::ConnectionBusy);
        }

        info!("Connecting to {}", peripheral);
        let mut updates = Vec::new();
        self.close_requested = false;

        match transport.connect(peripheral) {
            Ok(handle) => {
                self.handle = Some(handle);
                self.transition(ConnectionState::Connecting, &mut updates);
            }
            Err(e) => {
                error!("Connect to {} failed: {}", peripheral, e);
                self.transition(ConnectionState::Disconnected, &mut updates);
                updates.push(LinkUpdate::Closed(e));
            }
        }
        Ok(updates)
    }

    /// Request a graceful disconnect. The handle is released once the
    /// transport confirms.
    pub fn disconnect<T: Transport>(&mut self, transport: &mut T) {
        if let Some(handle) = &self.handle {
            info!("Disconnecting from {}", handle.peripheral());
            self.close_requested = true;
            transport.disconnect(handle);
        }
    }

    /// Release the connection immediately without waiting for the transport.
    pub fn shutdown<T: Transport>(&mut self, transport: &mut T) -> Vec<LinkUpdate> {
        let mut updates = Vec::new();
        if self.handle.is_some() {
            self.teardown(
                transport,
                SensorError::Disconnected { requested: true },
                &mut updates,
            );
        }
        updates
    }

    /// Feed one transport event through the state machine
    pub fn handle_event<T: Transport>(
        &mut self,
        transport: &mut T,
        event: &TransportEvent,
    ) -> Vec<LinkUpdate> {
        let mut updates = Vec::new();

        let Some(link) = self.handle.as_ref().map(|h| h.link()) else {
            debug!("No active connection, dropping {:?}", event);
            return updates;
        };

        match event {
            TransportEvent::ConnectionStateChanged {
                link: event_link,
                status,
                state,
            } if *event_link == link => {
                self.on_connection_state(transport, status, *state, &mut updates);
            }
            TransportEvent::ServicesDiscovered {
                link: event_link,
                status,
                services,
            } if *event_link == link => {
                self.on_services_discovered(transport, status, services, &mut updates);
            }
            TransportEvent::DescriptorWritten {
                link: event_link,
                status,
            } if *event_link == link => {
                self.on_descriptor_written(transport, status, &mut updates);
            }
            TransportEvent::NotificationsFailed {
                link: event_link,
                reason,
            } if *event_link == link => {
                self.on_notifications_failed(transport, reason, &mut updates);
            }
            TransportEvent::CharacteristicChanged {
                link: event_link,
                characteristic,
                value,
            } if *event_link == link => {
                self.on_characteristic_changed(characteristic, value, &mut updates);
            }
            TransportEvent::ScanResult(_) | TransportEvent::ScanFailed(_) => {}
            other => debug!("Ignoring event for stale link: {:?}", other),
        }

        updates
    }

    fn on_connection_state<T: Transport>(
        &mut self,
        transport: &mut T,
        status: &GattStatus,
        state: LinkState,
        updates: &mut Vec<LinkUpdate>,
    ) {
        if status.is_success() && state == LinkState::Connected {
            if self.state != ConnectionState::Connecting {
                debug!("Duplicate connected callback in state {}", self.state);
                return;
            }
            let Some(handle) = &self.handle else {
                return;
            };
            info!("Successfully connected to {}", handle.peripheral());
            updates.push(LinkUpdate::Connected(handle.peripheral().clone()));
            self.transition(ConnectionState::DiscoveringServices, updates);

            let requested = self
                .handle
                .as_ref()
                .map(|h| transport.discover_services(h));
            if let Some(Err(e)) = requested {
                self.teardown(transport, e, updates);
            }
            return;
        }

        let reason = if self.close_requested {
            SensorError::Disconnected { requested: true }
        } else if self.state == ConnectionState::Connecting {
            match status {
                GattStatus::Failure(detail) => SensorError::TransportConnectError(detail.clone()),
                GattStatus::Success => {
                    SensorError::TransportConnectError("peer never reached connected state".into())
                }
            }
        } else {
            SensorError::Disconnected { requested: false }
        };

        match &reason {
            SensorError::Disconnected { requested: true } => info!("Disconnected on request"),
            _ => warn!("Connection lost in state {}: {}", self.state, reason),
        }
        self.teardown(transport, reason, updates);
    }

    fn on_services_discovered<T: Transport>(
        &mut self,
        transport: &mut T,
        status: &GattStatus,
        services: &[GattService],
        updates: &mut Vec<LinkUpdate>,
    ) {
        if self.state != ConnectionState::DiscoveringServices {
            debug!("Unexpected discovery result in state {}", self.state);
            return;
        }

        if let GattStatus::Failure(detail) = status {
            error!("Service discovery failed: {}", detail);
            self.teardown(
                transport,
                SensorError::TransportConnectError(format!("service discovery failed: {}", detail)),
                updates,
            );
            return;
        }

        info!("Discovered {} services", services.len());

        let Some(service) = services
            .iter()
            .find(|s| s.uuid == self.profile.service_uuid)
        else {
            error!("Service {} not found", self.profile.service_uuid);
            let reason =
                SensorError::ProfileMismatch(format!("service {} missing", self.profile.service_uuid));
            self.teardown(transport, reason, updates);
            return;
        };

        let Some(characteristic) = service
            .characteristics
            .iter()
            .find(|c| c.uuid == self.profile.characteristic_uuid)
            .cloned()
        else {
            error!("Characteristic {} not found", self.profile.characteristic_uuid);
            let reason = SensorError::ProfileMismatch(format!(
                "characteristic {} missing",
                self.profile.characteristic_uuid
            ));
            self.teardown(transport, reason, updates);
            return;
        };

        self.transition(ConnectionState::Subscribing, updates);

        let Some(handle) = &self.handle else {
            return;
        };
        if let Err(e) = transport.set_notifications(handle, &characteristic, true) {
            error!("Could not subscribe to characteristic notifications: {}", e);
            let reason = if matches!(e, SensorError::NotificationSubscribeFailed(_)) {
                e
            } else {
                SensorError::NotificationSubscribeFailed(e.to_string())
            };
            self.teardown(transport, reason, updates);
            return;
        }

        if !characteristic.has_descriptor(&self.profile.ccc_descriptor_uuid) {
            // Older firmware has no CCC descriptor; local registration is enough
            info!("No CCC descriptor, relying on notification registration");
            self.transition(ConnectionState::Ready, updates);
            return;
        }

        debug!("Writing enable-notifications to CCC descriptor");
        let written = transport.write_descriptor(
            handle,
            &characteristic,
            self.profile.ccc_descriptor_uuid,
            &ENABLE_NOTIFICATION_VALUE,
        );
        if let Err(e) = written {
            error!("CCC descriptor write could not be issued: {}", e);
            self.teardown(
                transport,
                SensorError::NotificationSubscribeFailed(e.to_string()),
                updates,
            );
        }
    }

    fn on_descriptor_written<T: Transport>(
        &mut self,
        transport: &mut T,
        status: &GattStatus,
        updates: &mut Vec<LinkUpdate>,
    ) {
        if self.state != ConnectionState::Subscribing {
            debug!("Unexpected descriptor write result in state {}", self.state);
            return;
        }

        match status {
            GattStatus::Success => {
                info!("Successfully subscribed to characteristic notifications");
                self.transition(ConnectionState::Ready, updates);
            }
            GattStatus::Failure(detail) => {
                error!("CCC descriptor write failed: {}", detail);
                self.teardown(
                    transport,
                    SensorError::NotificationSubscribeFailed(detail.clone()),
                    updates,
                );
            }
        }
    }

    fn on_notifications_failed<T: Transport>(
        &mut self,
        transport: &mut T,
        reason: &str,
        updates: &mut Vec<LinkUpdate>,
    ) {
        if !matches!(
            self.state,
            ConnectionState::Subscribing | ConnectionState::Ready
        ) {
            debug!("Notification failure in state {} ignored", self.state);
            return;
        }
        error!("Notification registration failed: {}", reason);
        self.teardown(
            transport,
            SensorError::NotificationSubscribeFailed(reason.to_string()),
            updates,
        );
    }

    fn on_characteristic_changed(
        &mut self,
        characteristic: &Uuid,
        value: &[u8],
        updates: &mut Vec<LinkUpdate>,
    ) {
        if self.state != ConnectionState::Ready {
            debug!("Notification before subscription completed, dropping");
            return;
        }
        if *characteristic != self.profile.characteristic_uuid {
            debug!("Notification from unrelated characteristic {}", characteristic);
            return;
        }

        match self.decoder.decode_reading(value) {
            Ok(reading) => {
                info!("Characteristic value changed. Temperature: {:4.1}", reading.celsius);
                updates.push(LinkUpdate::Reading(reading));
            }
            Err(e) => {
                // A single bad frame is not fatal
                warn!("Dropping notification {:02X?}: {}", value, e);
                updates.push(LinkUpdate::DecodeFailed(e));
            }
        }
    }

    fn teardown<T: Transport>(
        &mut self,
        transport: &mut T,
        reason: SensorError,
        updates: &mut Vec<LinkUpdate>,
    ) {
        if let Some(handle) = self.handle.take() {
            debug!("Releasing link {}", handle.link());
            transport.close(handle);
        }
        self.close_requested = false;
        self.transition(ConnectionState::Disconnected, updates);
        updates.push(LinkUpdate::Closed(reason));
    }

    fn transition(&mut self, next: ConnectionState, updates: &mut Vec<LinkUpdate>) {
        if self.state == next {
            return;
        }
        debug!("Connection state {} -> {}", self.state, next);
        self.state = next;
        updates.push(LinkUpdate::State(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{MockTransport, TransportCall};
    use crate::infrastructure::bluetooth::protocol::{self, parse_uuid, DecodeMode};
    use crate::infrastructure::bluetooth::transport::{GattCharacteristic, LinkId};

    fn profile() -> TargetProfile {
        TargetProfile {
            service_uuid: parse_uuid(protocol::SERVICE_UUID).unwrap(),
            characteristic_uuid: parse_uuid(protocol::TEMPERATURE_CHAR_UUID).unwrap(),
            ccc_descriptor_uuid: parse_uuid(protocol::CCC_DESCRIPTOR_UUID).unwrap(),
        }
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(profile(), TemperatureDecoder::default())
    }

    fn esp32() -> PeripheralIdentity {
        PeripheralIdentity::new("24:0A:C4:00:11:22", protocol::DEVICE_NAME)
    }

    fn services(with_characteristic: bool, with_ccc: bool) -> Vec<GattService> {
        let p = profile();
        let mut characteristics = vec![GattCharacteristic {
            uuid: Uuid::from_u128(0x2a19),
            service_uuid: p.service_uuid,
            descriptors: vec![],
        }];
        if with_characteristic {
            characteristics.push(GattCharacteristic {
                uuid: p.characteristic_uuid,
                service_uuid: p.service_uuid,
                descriptors: if with_ccc {
                    vec![p.ccc_descriptor_uuid]
                } else {
                    vec![]
                },
            });
        }
        vec![GattService {
            uuid: p.service_uuid,
            characteristics,
        }]
    }

    fn connected(link: LinkId) -> TransportEvent {
        TransportEvent::ConnectionStateChanged {
            link,
            status: GattStatus::Success,
            state: LinkState::Connected,
        }
    }

    fn dropped(link: LinkId) -> TransportEvent {
        TransportEvent::ConnectionStateChanged {
            link,
            status: GattStatus::Failure("link supervision timeout".to_string()),
            state: LinkState::Disconnected,
        }
    }

    fn discovered(link: LinkId, services: Vec<GattService>) -> TransportEvent {
        TransportEvent::ServicesDiscovered {
            link,
            status: GattStatus::Success,
            services,
        }
    }

    fn notification(link: LinkId, value: &[u8]) -> TransportEvent {
        TransportEvent::CharacteristicChanged {
            link,
            characteristic: profile().characteristic_uuid,
            value: value.to_vec(),
        }
    }

    /// Drive a fresh manager to `Ready` with a CCC descriptor present
    fn ready(transport: &mut MockTransport) -> ConnectionManager {
        let mut m = manager();
        m.connect(transport, &esp32()).unwrap();
        m.handle_event(transport, &connected(1));
        m.handle_event(transport, &discovered(1, services(true, true)));
        m.handle_event(
            transport,
            &TransportEvent::DescriptorWritten {
                link: 1,
                status: GattStatus::Success,
            },
        );
        assert_eq!(m.state(), ConnectionState::Ready);
        m
    }

    #[test]
    fn test_full_subscription_sequence() {
        let mut transport = MockTransport::new();
        let mut m = manager();

        let updates = m.connect(&mut transport, &esp32()).unwrap();
        assert_eq!(updates, vec![LinkUpdate::State(ConnectionState::Connecting)]);
        assert!(m.is_active());

        let updates = m.handle_event(&mut transport, &connected(1));
        assert_eq!(
            updates,
            vec![
                LinkUpdate::Connected(esp32()),
                LinkUpdate::State(ConnectionState::DiscoveringServices)
            ]
        );
        assert_eq!(transport.last_call(), Some(&TransportCall::DiscoverServices(1)));

        let updates = m.handle_event(&mut transport, &discovered(1, services(true, true)));
        assert_eq!(updates, vec![LinkUpdate::State(ConnectionState::Subscribing)]);
        let p = profile();
        assert_eq!(
            &transport.calls[transport.calls.len() - 2..],
            &[
                TransportCall::SetNotifications {
                    link: 1,
                    characteristic: p.characteristic_uuid,
                    enable: true
                },
                TransportCall::WriteDescriptor {
                    link: 1,
                    descriptor: p.ccc_descriptor_uuid,
                    value: vec![0x01, 0x00]
                }
            ]
        );

        let updates = m.handle_event(
            &mut transport,
            &TransportEvent::DescriptorWritten {
                link: 1,
                status: GattStatus::Success,
            },
        );
        assert_eq!(updates, vec![LinkUpdate::State(ConnectionState::Ready)]);
    }

    #[test]
    fn test_missing_service_is_profile_mismatch() {
        let mut transport = MockTransport::new();
        let mut m = manager();
        m.connect(&mut transport, &esp32()).unwrap();
        m.handle_event(&mut transport, &connected(1));

        let battery = GattService {
            uuid: Uuid::from_u128(0x180f),
            characteristics: vec![],
        };
        let updates = m.handle_event(&mut transport, &discovered(1, vec![battery]));

        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(matches!(
            updates.last(),
            Some(LinkUpdate::Closed(SensorError::ProfileMismatch(_)))
        ));
        assert_eq!(
            transport.count(|c| matches!(
                c,
                TransportCall::SetNotifications { .. } | TransportCall::WriteDescriptor { .. }
            )),
            0
        );
        assert!(transport.open_links.is_empty());
        assert!(!m.is_active());
    }

    #[test]
    fn test_missing_characteristic_is_profile_mismatch() {
        let mut transport = MockTransport::new();
        let mut m = manager();
        m.connect(&mut transport, &esp32()).unwrap();
        m.handle_event(&mut transport, &connected(1));

        let updates = m.handle_event(&mut transport, &discovered(1, services(false, false)));
        assert!(matches!(
            updates.last(),
            Some(LinkUpdate::Closed(SensorError::ProfileMismatch(_)))
        ));
        assert_eq!(transport.count(|c| matches!(c, TransportCall::SetNotifications { .. })), 0);
        assert!(transport.open_links.is_empty());
    }

    #[test]
    fn test_ready_without_ccc_descriptor() {
        let mut transport = MockTransport::new();
        let mut m = manager();
        m.connect(&mut transport, &esp32()).unwrap();
        m.handle_event(&mut transport, &connected(1));

        let updates = m.handle_event(&mut transport, &discovered(1, services(true, false)));
        assert_eq!(
            updates,
            vec![
                LinkUpdate::State(ConnectionState::Subscribing),
                LinkUpdate::State(ConnectionState::Ready)
            ]
        );
        assert_eq!(transport.count(|c| matches!(c, TransportCall::SetNotifications { .. })), 1);
        assert_eq!(transport.count(|c| matches!(c, TransportCall::WriteDescriptor { .. })), 0);
    }

    #[test]
    fn test_descriptor_write_failure() {
        let mut transport = MockTransport::new();
        let mut m = manager();
        m.connect(&mut transport, &esp32()).unwrap();
        m.handle_event(&mut transport, &connected(1));
        m.handle_event(&mut transport, &discovered(1, services(true, true)));

        let updates = m.handle_event(
            &mut transport,
            &TransportEvent::DescriptorWritten {
                link: 1,
                status: GattStatus::Failure("write not permitted".to_string()),
            },
        );
        assert_eq!(
            updates.last(),
            Some(&LinkUpdate::Closed(SensorError::NotificationSubscribeFailed(
                "write not permitted".to_string()
            )))
        );
        assert!(transport.open_links.is_empty());
    }

    #[test]
    fn test_notification_registration_failure() {
        let mut transport = MockTransport {
            fail_set_notifications: true,
            ..MockTransport::default()
        };
        let mut m = manager();
        m.connect(&mut transport, &esp32()).unwrap();
        m.handle_event(&mut transport, &connected(1));

        let updates = m.handle_event(&mut transport, &discovered(1, services(true, true)));
        assert!(matches!(
            updates.last(),
            Some(LinkUpdate::Closed(SensorError::NotificationSubscribeFailed(_)))
        ));
        assert_eq!(transport.count(|c| matches!(c, TransportCall::WriteDescriptor { .. })), 0);
    }

    #[test]
    fn test_registration_refused_after_ready() {
        let mut transport = MockTransport::new();
        let mut m = manager();
        m.connect(&mut transport, &esp32()).unwrap();
        m.handle_event(&mut transport, &connected(1));
        m.handle_event(&mut transport, &discovered(1, services(true, false)));
        assert_eq!(m.state(), ConnectionState::Ready);

        let updates = m.handle_event(
            &mut transport,
            &TransportEvent::NotificationsFailed {
                link: 1,
                reason: "subscribe rejected".to_string(),
            },
        );
        assert_eq!(
            updates,
            vec![
                LinkUpdate::State(ConnectionState::Disconnected),
                LinkUpdate::Closed(SensorError::NotificationSubscribeFailed(
                    "subscribe rejected".to_string()
                ))
            ]
        );
        assert!(transport.open_links.is_empty());
        assert!(!m.is_active());
    }

    #[test]
    fn test_registration_refused_while_writing_ccc() {
        let mut transport = MockTransport::new();
        let mut m = manager();
        m.connect(&mut transport, &esp32()).unwrap();
        m.handle_event(&mut transport, &connected(1));
        m.handle_event(&mut transport, &discovered(1, services(true, true)));
        assert_eq!(m.state(), ConnectionState::Subscribing);

        let updates = m.handle_event(
            &mut transport,
            &TransportEvent::NotificationsFailed {
                link: 1,
                reason: "no notify property".to_string(),
            },
        );
        assert!(matches!(
            updates.last(),
            Some(LinkUpdate::Closed(SensorError::NotificationSubscribeFailed(_)))
        ));

        // The late descriptor confirmation belongs to a released link
        let updates = m.handle_event(
            &mut transport,
            &TransportEvent::DescriptorWritten {
                link: 1,
                status: GattStatus::Success,
            },
        );
        assert!(updates.is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_discovery_failure_closes_link() {
        let mut transport = MockTransport::new();
        let mut m = manager();
        m.connect(&mut transport, &esp32()).unwrap();
        m.handle_event(&mut transport, &connected(1));

        let updates = m.handle_event(
            &mut transport,
            &TransportEvent::ServicesDiscovered {
                link: 1,
                status: GattStatus::Failure("status 129".to_string()),
                services: vec![],
            },
        );
        assert!(matches!(
            updates.last(),
            Some(LinkUpdate::Closed(SensorError::TransportConnectError(_)))
        ));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(transport.last_call(), Some(&TransportCall::Close(1)));
        assert!(transport.open_links.is_empty());
        assert!(!m.is_active());
    }

    #[test]
    fn test_discovery_request_refused_closes_link() {
        let mut transport = MockTransport {
            fail_discover_services: true,
            ..MockTransport::default()
        };
        let mut m = manager();
        m.connect(&mut transport, &esp32()).unwrap();

        let updates = m.handle_event(&mut transport, &connected(1));
        assert_eq!(
            updates.last(),
            Some(&LinkUpdate::Closed(SensorError::TransportConnectError(
                "GATT request queue full".to_string()
            )))
        );
        assert!(transport.open_links.is_empty());
        assert!(!m.is_active());
    }

    #[test]
    fn test_connect_error_status() {
        let mut transport = MockTransport::new();
        let mut m = manager();
        m.connect(&mut transport, &esp32()).unwrap();

        let updates = m.handle_event(
            &mut transport,
            &TransportEvent::ConnectionStateChanged {
                link: 1,
                status: GattStatus::Failure("status 133".to_string()),
                state: LinkState::Disconnected,
            },
        );
        assert_eq!(
            updates,
            vec![
                LinkUpdate::State(ConnectionState::Disconnected),
                LinkUpdate::Closed(SensorError::TransportConnectError("status 133".to_string()))
            ]
        );
        assert_eq!(transport.last_call(), Some(&TransportCall::Close(1)));
    }

    #[test]
    fn test_connect_refused_by_transport() {
        let mut transport = MockTransport {
            fail_connect: true,
            ..MockTransport::default()
        };
        let mut m = manager();

        let updates = m.connect(&mut transport, &esp32()).unwrap();
        assert!(matches!(
            updates.last(),
            Some(LinkUpdate::Closed(SensorError::TransportConnectError(_)))
        ));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(!m.is_active());
    }

    #[test]
    fn test_second_connect_is_busy() {
        let mut transport = MockTransport::new();
        let mut m = manager();
        m.connect(&mut transport, &esp32()).unwrap();
        assert_eq!(
            m.connect(&mut transport, &esp32()),
            Err(SensorError::ConnectionBusy)
        );
        assert_eq!(transport.open_links, vec![1]);
    }

    #[test]
    fn test_notifications_decode_and_survive_bad_frames() {
        let mut transport = MockTransport::new();
        let mut m = ready(&mut transport);

        let updates = m.handle_event(&mut transport, &notification(1, &[0xE8, 0x03]));
        match updates.as_slice() {
            [LinkUpdate::Reading(reading)] => {
                let expected = TemperatureDecoder::default().decode(&[0xE8, 0x03]).unwrap();
                assert_eq!(reading.celsius, expected);
            }
            other => panic!("expected a reading, got {:?}", other),
        }

        let updates = m.handle_event(&mut transport, &notification(1, &[0x00, 0x00]));
        assert!(matches!(
            updates.as_slice(),
            [LinkUpdate::DecodeFailed(SensorError::MalformedPayload(_))]
        ));
        assert_eq!(m.state(), ConnectionState::Ready);

        let updates = m.handle_event(&mut transport, &notification(1, &[0x00, 0x08]));
        assert!(matches!(updates.as_slice(), [LinkUpdate::Reading(_)]));
    }

    #[test]
    fn test_direct_mode_notifications() {
        let mut transport = MockTransport::new();
        let mut m = ConnectionManager::new(
            profile(),
            TemperatureDecoder::new(DecodeMode::Direct, Default::default()),
        );
        m.connect(&mut transport, &esp32()).unwrap();
        m.handle_event(&mut transport, &connected(1));
        m.handle_event(&mut transport, &discovered(1, services(true, false)));

        let updates = m.handle_event(&mut transport, &notification(1, &87.25f64.to_le_bytes()));
        assert!(matches!(updates.as_slice(), [LinkUpdate::Reading(r)] if r.celsius == 87.25));
    }

    #[test]
    fn test_unexpected_drop_while_ready() {
        let mut transport = MockTransport::new();
        let mut m = ready(&mut transport);

        let updates = m.handle_event(&mut transport, &dropped(1));
        assert_eq!(
            updates,
            vec![
                LinkUpdate::State(ConnectionState::Disconnected),
                LinkUpdate::Closed(SensorError::Disconnected { requested: false })
            ]
        );
        assert!(transport.open_links.is_empty());
        assert!(!m.is_active());

        // Late notifications from the dead link are ignored
        assert!(m.handle_event(&mut transport, &notification(1, &[0xE8, 0x03])).is_empty());
    }

    #[test]
    fn test_requested_disconnect() {
        let mut transport = MockTransport::new();
        let mut m = ready(&mut transport);

        m.disconnect(&mut transport);
        assert_eq!(transport.last_call(), Some(&TransportCall::Disconnect(1)));
        assert!(m.is_active());

        let updates = m.handle_event(
            &mut transport,
            &TransportEvent::ConnectionStateChanged {
                link: 1,
                status: GattStatus::Success,
                state: LinkState::Disconnected,
            },
        );
        assert_eq!(
            updates.last(),
            Some(&LinkUpdate::Closed(SensorError::Disconnected { requested: true }))
        );
        assert!(transport.open_links.is_empty());
    }

    #[test]
    fn test_shutdown_releases_immediately() {
        let mut transport = MockTransport::new();
        let mut m = manager();
        m.connect(&mut transport, &esp32()).unwrap();
        m.handle_event(&mut transport, &connected(1));

        let updates = m.shutdown(&mut transport);
        assert_eq!(
            updates.last(),
            Some(&LinkUpdate::Closed(SensorError::Disconnected { requested: true }))
        );
        assert!(transport.open_links.is_empty());
        assert!(m.shutdown(&mut transport).is_empty());
    }

    #[test]
    fn test_stale_link_events_ignored_after_reconnect() {
        let mut transport = MockTransport::new();
        let mut m = ready(&mut transport);
        m.handle_event(&mut transport, &dropped(1));

        m.connect(&mut transport, &esp32()).unwrap();
        assert_eq!(m.state(), ConnectionState::Connecting);

        // A late callback from link 1 must not advance link 2
        assert!(m.handle_event(&mut transport, &connected(1)).is_empty());
        assert!(m.handle_event(&mut transport, &dropped(1)).is_empty());
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(transport.open_links, vec![2]);

        m.handle_event(&mut transport, &connected(2));
        assert_eq!(m.state(), ConnectionState::DiscoveringServices);
    }
}
