// smp-ble - SMP transport over Bluetooth Low Energy

pub mod ble;
pub mod config;
pub mod header;
pub mod transport;

pub use ble::gatt::{SMP_CHARACTERISTIC_UUID, SMP_SERVICE_UUID};
pub use ble::BleError;
pub use config::{ConfigError, TransportConfig};
pub use header::{HeaderCodec, SmpHeader, SmpHeaderCodec, SmpOp, HEADER_SIZE};
pub use transport::{
    ConnectionState, FramingViolation, SmpBleTransport, SmpTransport, TransportError,
};
