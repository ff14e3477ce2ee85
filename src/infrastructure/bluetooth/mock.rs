use crate::domain::models::PeripheralIdentity;
use crate::error::SensorError;
use crate::infrastructure::bluetooth::transport::{
    ConnectionHandle, GattCharacteristic, LinkId, Transport,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    StartScan(Vec<Uuid>),
    StopScan,
    Connect(PeripheralIdentity),
    DiscoverServices(LinkId),
    SetNotifications {
        link: LinkId,
        characteristic: Uuid,
        enable: bool,
    },
    WriteDescriptor {
        link: LinkId,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    Disconnect(LinkId),
    Close(LinkId),
}

/// Records every command; never produces events on its own.
#[derive(Debug)]
pub struct MockTransport {
    pub radio_enabled: bool,
    pub scan_permission: bool,
    pub fail_connect: bool,
    pub fail_set_notifications: bool,
    pub fail_discover_services: bool,
    pub calls: Vec<TransportCall>,
    pub open_links: Vec<LinkId>,
    pub next_link: LinkId,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            radio_enabled: true,
            scan_permission: true,
            fail_connect: false,
            fail_set_notifications: false,
            fail_discover_services: false,
            calls: Vec::new(),
            open_links: Vec::new(),
            next_link: 1,
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn last_call(&self) -> Option<&TransportCall> {
        self.calls.last()
    }
}

impl Transport for MockTransport {
    fn is_radio_enabled(&self) -> bool {
        self.radio_enabled
    }

    fn has_scan_permission(&self) -> bool {
        self.scan_permission
    }

    fn start_scan(&mut self, services: &[Uuid]) -> Result<(), SensorError> {
        self.calls.push(TransportCall::StartScan(services.to_vec()));
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.calls.push(TransportCall::StopScan);
    }

    fn connect(
        &mut self,
        peripheral: &PeripheralIdentity,
    ) -> Result<ConnectionHandle, SensorError> {
        self.calls.push(TransportCall::Connect(peripheral.clone()));
        if self.fail_connect {
            return Err(SensorError::TransportConnectError(
                "no connection slots".to_string(),
            ));
        }
        let link = self.next_link;
        self.next_link += 1;
        self.open_links.push(link);
        Ok(ConnectionHandle::new(link, peripheral.clone()))
    }

    fn discover_services(&mut self, handle: &ConnectionHandle) -> Result<(), SensorError> {
        self.calls.push(TransportCall::DiscoverServices(handle.link()));
        if self.fail_discover_services {
            return Err(SensorError::TransportConnectError(
                "GATT request queue full".to_string(),
            ));
        }
        Ok(())
    }

    fn set_notifications(
        &mut self,
        handle: &ConnectionHandle,
        characteristic: &GattCharacteristic,
        enable: bool,
    ) -> Result<(), SensorError> {
        self.calls.push(TransportCall::SetNotifications {
            link: handle.link(),
            characteristic: characteristic.uuid,
            enable,
        });
        if self.fail_set_notifications {
            return Err(SensorError::NotificationSubscribeFailed(
                "characteristic is not notifiable".to_string(),
            ));
        }
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        handle: &ConnectionHandle,
        _characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), SensorError> {
        self.calls.push(TransportCall::WriteDescriptor {
            link: handle.link(),
            descriptor,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn disconnect(&mut self, handle: &ConnectionHandle) {
        self.calls.push(TransportCall::Disconnect(handle.link()));
    }

    fn close(&mut self, handle: ConnectionHandle) {
        self.calls.push(TransportCall::Close(handle.link()));
        self.open_links.retain(|l| *l != handle.link());
    }
}
