//! SMP transport over a BLE GATT characteristic
//!
//! Splits outgoing SMP messages into MTU-sized writes and reassembles the
//! notification stream coming back into whole, length-delimited messages.
//! The transport is strictly half-duplex: one request, then one response.

pub mod assembler;
pub mod ble;
pub mod sender;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::ble::BleError;
use crate::header::HeaderError;

pub use assembler::FrameAssembler;
pub use ble::SmpBleTransport;
pub use sender::FragmentSender;

/// Connection state as seen by the assembler and the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// The inbound byte stream can no longer be trusted.
///
/// Fatal for the connection: the caller should disconnect and reconnect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingViolation {
    #[error("received {actual} bytes for a {expected} byte message")]
    Overrun { expected: usize, actual: usize },

    #[error("notification from unexpected characteristic {0}")]
    UnexpectedSource(Uuid),

    #[error("undecodable header: {0}")]
    Header(#[from] HeaderError),

    #[error("a previous receive was abandoned mid-message; reconnect before reuse")]
    AbandonedReceive,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    #[error("Device is not an SMP server: missing characteristic {0}")]
    NotAnSmpServer(Uuid),

    #[error("Not connected")]
    NotConnected,

    #[error("Framing violation: {0}")]
    FramingViolation(#[from] FramingViolation),

    #[error("Another receive is already waiting for a response")]
    ReceiveInProgress,

    #[error("Invalid MTU: {0}")]
    InvalidMtu(usize),

    #[error("Link error: {0}")]
    Link(BleError),
}

impl From<BleError> for TransportError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::Disconnected => TransportError::NotConnected,
            other => TransportError::Link(other),
        }
    }
}

/// A client-side channel that carries whole SMP messages.
#[async_trait]
pub trait SmpTransport: Send + Sync {
    /// Connect to the device named by `identifier`.
    async fn connect(&self, identifier: &str) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Send one encoded SMP request.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Wait for one whole SMP response (header and payload).
    async fn receive(&self) -> Result<Vec<u8>, TransportError>;

    async fn send_and_receive(&self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.send(data).await?;
        self.receive().await
    }

    /// Current per-write payload budget in bytes.
    fn mtu(&self) -> Result<usize, TransportError>;

    /// Record the SMP server's transport buffer size, in bytes. Zero
    /// means unknown.
    fn initialize(&self, server_buffer_size: usize);

    /// Largest message that can be handed to [`SmpTransport::send`].
    ///
    /// The server's buffer size when known, the MTU otherwise.
    fn max_unencoded_size(&self) -> Result<usize, TransportError>;
}
