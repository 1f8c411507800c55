//! BLE GATT link layer
//!
//! Provides the GATT link abstraction the SMP transport is built on, the SMP
//! service definition, a simulated link for testing, and (behind the
//! `ble-central` feature) a btleplug-backed link for real hardware.

#[cfg(feature = "ble-central")]
pub mod btleplug_link;
pub mod gatt;
pub mod link;
pub mod simulated;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Payload exceeds MTU ({size} > {mtu})")]
    MtuExceeded { size: usize, mtu: usize },

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
