use thiserror::Error;

/// Camera or media stream could not be obtained, or went away mid-session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("camera disconnected")]
    Disconnected,
}

/// Telemetry channel failed to open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("invalid telemetry address '{0}'")]
    InvalidAddress(String),
    #[error("telemetry handshake failed: {0}")]
    Handshake(String),
}

/// Telemetry channel errored or closed while streaming.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("telemetry channel closed: {reason}")]
pub struct TransportError {
    pub reason: String,
}

/// A single inbound telemetry message could not be parsed. Always handled locally.
#[derive(Debug, Error)]
#[error("malformed telemetry message: {0}")]
pub struct MalformedTelemetry(#[from] pub serde_json::Error);

/// A user action was attempted before any session was started.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("start monitoring first")]
pub struct PreconditionError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("authorization expired, please sign in again")]
    AuthorizationExpired,
    #[error("login failed: incorrect username or password")]
    LoginFailed,
    #[error("record store rejected request with status {status}")]
    Rejected { status: u16 },
    #[error("record store request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors surfaced by the session controller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session is already active")]
    AlreadyActive,
    #[error("session start was cancelled")]
    Cancelled,
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn is_authorization_expired(&self) -> bool {
        matches!(self, SessionError::Store(StoreError::AuthorizationExpired))
    }
}
