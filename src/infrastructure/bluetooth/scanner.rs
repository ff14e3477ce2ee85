//! BLE Scanner Module
//!
//! First-match scan sessions for the thermometer. A session ends on the
//! first advertisement that passes the filter, when its window elapses, or
//! when the transport reports a scan failure.

use crate::domain::models::PeripheralIdentity;
use crate::error::SensorError;
use crate::infrastructure::bluetooth::transport::{
    Advertisement, BleEvent, EventSender, ScanSessionId, Transport,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Both the advertised name and the advertised service must match.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFilter {
    pub device_name: String,
    pub service_uuid: Uuid,
}

impl ScanFilter {
    pub fn new(device_name: impl Into<String>, service_uuid: Uuid) -> Self {
        Self {
            device_name: device_name.into(),
            service_uuid,
        }
    }

    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        advertisement.identity.name == self.device_name
            && advertisement.service_uuids.contains(&self.service_uuid)
    }
}

/// How a scan session ended
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Matched(PeripheralIdentity),
    TimedOut,
    Failed(SensorError),
}

struct ActiveScan {
    session: ScanSessionId,
    timer: JoinHandle<()>,
}

/// BLE scanner owning at most one active session
pub struct BleScanner {
    filter: ScanFilter,
    timeout: Duration,
    event_sender: EventSender,
    active: Option<ActiveScan>,
    next_session: ScanSessionId,
}

impl BleScanner {
    pub fn new(filter: ScanFilter, timeout: Duration, event_sender: EventSender) -> Self {
        Self {
            filter,
            timeout,
            event_sender,
            active: None,
            next_session: 1,
        }
    }

    pub fn filter(&self) -> &ScanFilter {
        &self.filter
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start a session. Must be called from within a tokio runtime.
    pub fn start<T: Transport>(&mut self, transport: &mut T) -> Result<ScanSessionId, SensorError> {
        if self.active.is_some() {
            return Err(SensorError::ScanAlreadyActive);
        }
        if !transport.is_radio_enabled() {
            return Err(SensorError::RadioDisabled);
        }
        if !transport.has_scan_permission() {
            return Err(SensorError::PermissionDenied);
        }

        transport.start_scan(&[self.filter.service_uuid])?;

        let session = self.next_session;
        self.next_session += 1;

        let sender = self.event_sender.clone();
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = sender.send(BleEvent::ScanTimeout { session });
        });

        info!(
            "Scan {} started for '{}' ({:?} window)",
            session, self.filter.device_name, timeout
        );
        self.active = Some(ActiveScan { session, timer });
        Ok(session)
    }

    /// Feed an advertisement. Returns the outcome if it ended the session.
    pub fn handle_advertisement<T: Transport>(
        &mut self,
        transport: &mut T,
        advertisement: &Advertisement,
    ) -> Option<ScanOutcome> {
        if self.active.is_none() {
            return None;
        }
        if !self.filter.matches(advertisement) {
            debug!("Ignoring advertisement from {}", advertisement.identity);
            return None;
        }

        info!("Scan matched {}", advertisement.identity);
        self.finish(transport);
        Some(ScanOutcome::Matched(advertisement.identity.clone()))
    }

    /// Handle a timer expiry. No-op unless `session` is still the active one.
    pub fn handle_timeout<T: Transport>(
        &mut self,
        transport: &mut T,
        session: ScanSessionId,
    ) -> Option<ScanOutcome> {
        match &self.active {
            Some(active) if active.session == session => {
                info!("Scan {} timed out after {:?}", session, self.timeout);
                self.finish(transport);
                Some(ScanOutcome::TimedOut)
            }
            _ => {
                debug!("Ignoring stale timeout for scan {}", session);
                None
            }
        }
    }

    pub fn handle_failure<T: Transport>(
        &mut self,
        transport: &mut T,
        reason: &str,
    ) -> Option<ScanOutcome> {
        self.active.as_ref()?;
        warn!("Scan failed: {}", reason);
        self.finish(transport);
        Some(ScanOutcome::Failed(SensorError::ScanFailed(reason.to_string())))
    }

    /// Stop scanning early
    pub fn stop<T: Transport>(&mut self, transport: &mut T) {
        if self.active.is_some() {
            info!("Stopping BLE scan...");
            self.finish(transport);
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.active.is_some()
    }

    fn finish<T: Transport>(&mut self, transport: &mut T) {
        if let Some(active) = self.active.take() {
            active.timer.abort();
            transport.stop_scan();
        }
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.timer.abort();
        }
    }
}
