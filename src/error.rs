use std::time::Duration;
use thiserror::Error;

/// Error type for the scan / connect / subscribe / decode pipeline.
///
/// Lifecycle errors never halt the orchestrator: they are reported as the
/// reason attached to a `Disconnected` transition and scanning restarts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("scan permission has not been granted")]
    PermissionDenied,

    #[error("bluetooth radio is disabled")]
    RadioDisabled,

    #[error("a scan session is already active")]
    ScanAlreadyActive,

    #[error("no matching peripheral found within {0:?}")]
    ScanTimedOut(Duration),

    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("a connection is already active")]
    ConnectionBusy,

    #[error("transport connect error: {0}")]
    TransportConnectError(String),

    #[error("peripheral does not implement the expected profile: {0}")]
    ProfileMismatch(String),

    #[error("failed to subscribe to notifications: {0}")]
    NotificationSubscribeFailed(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("disconnected (requested: {requested})")]
    Disconnected { requested: bool },
}
