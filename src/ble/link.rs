//! GATT link trait definitions and core types
//!
//! Defines the abstract BLE central and GATT link interface that the SMP
//! transport drives. Both the simulated network and the btleplug backend
//! conform to it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::BleError;

/// Called with `(source characteristic, bytes)` for every notification.
///
/// Runs in the link's notification-delivery context and must not block.
pub type NotificationHandler = Box<dyn Fn(Uuid, &[u8]) + Send + Sync>;

/// Called once when the peer drops the connection.
pub type DisconnectHandler = Box<dyn Fn() + Send + Sync>;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A 6-byte BLE MAC address.
    Mac([u8; 6]),
    /// A platform-assigned identifier (CoreBluetooth, simulated devices).
    Uuid(Uuid),
}

impl BleAddress {
    /// Parse `XX:XX:XX:XX:XX:XX` (hex digits in either case).
    pub fn parse_mac(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next()?;
            if part.len() != 2 || !part.bytes().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            *byte = u8::from_str_radix(part, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(BleAddress::Mac(bytes))
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Mac(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            BleAddress::Uuid(id) => write!(f, "{}", id.hyphenated()),
        }
    }
}

/// How the caller named the device it wants to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdentifier {
    Address(BleAddress),
    Name(String),
}

impl DeviceIdentifier {
    /// MAC addresses and UUIDs resolve by address; anything else is treated
    /// as an advertised name.
    pub fn parse(s: &str) -> Self {
        if let Some(mac) = BleAddress::parse_mac(s) {
            return DeviceIdentifier::Address(mac);
        }
        match Uuid::parse_str(s) {
            Ok(id) => DeviceIdentifier::Address(BleAddress::Uuid(id)),
            Err(_) => DeviceIdentifier::Name(s.to_string()),
        }
    }

    /// Whether `device` is the one this identifier names.
    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        match self {
            DeviceIdentifier::Address(addr) => &device.address == addr,
            DeviceIdentifier::Name(name) => device.name.as_deref() == Some(name.as_str()),
        }
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdentifier::Address(addr) => write!(f, "address {}", addr),
            DeviceIdentifier::Name(name) => write!(f, "name '{}'", name),
        }
    }
}

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub address: BleAddress,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
    /// Service UUIDs listed in the advertisement.
    pub services: Vec<Uuid>,
}

/// An established GATT connection to a peripheral.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Current per-write payload budget for writes without response.
    ///
    /// May change after connection as the platform renegotiates.
    fn mtu(&self) -> usize;

    /// Whether service discovery found `characteristic` inside `service`.
    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    /// Write one segment to `characteristic`.
    async fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError>;

    /// Enable notifications on `characteristic`, delivering them to `handler`.
    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), BleError>;

    /// Register a callback fired when the peer drops the connection.
    fn on_disconnected(&self, handler: DisconnectHandler);

    /// Tear down the connection.
    async fn disconnect(&self) -> Result<(), BleError>;

    /// Check whether the connection is still active.
    fn is_connected(&self) -> bool;
}

/// BLE central role: finding peripherals and connecting to them.
#[async_trait]
pub trait GattCentral: Send + Sync {
    /// Scan for `timeout` and return the devices advertising `service`.
    async fn scan(&self, service: Uuid, timeout: Duration)
        -> Result<Vec<DiscoveredDevice>, BleError>;

    /// Look for a single device, giving up after `timeout`.
    async fn find_device(
        &self,
        identifier: &DeviceIdentifier,
        timeout: Duration,
    ) -> Result<Option<DiscoveredDevice>, BleError>;

    /// Connect to `device` and discover its services.
    async fn connect(&self, device: &DiscoveredDevice) -> Result<Arc<dyn GattLink>, BleError>;
}
