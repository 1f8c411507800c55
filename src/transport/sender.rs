//! Outbound fragmentation
//!
//! A GATT write without response carries at most one MTU's worth of bytes,
//! so an SMP request is written as a run of MTU-sized segments. Segments are
//! purely size-based; the last one is short when the message length is not a
//! multiple of the MTU.

use uuid::Uuid;

use super::{FrameAssembler, TransportError};
use crate::ble::link::GattLink;

/// Writes whole messages to a characteristic in MTU-sized segments.
#[derive(Debug, Clone)]
pub struct FragmentSender {
    characteristic: Uuid,
}

impl FragmentSender {
    pub fn new(characteristic: Uuid) -> Self {
        Self { characteristic }
    }

    /// Write `data` to `link`, one segment at a time.
    ///
    /// The MTU is read from the link on every call since it can change after
    /// the connection is established. Each write completes before the next
    /// one is issued; the link's write is the unit of backpressure. A failed
    /// write is returned as-is with no retry of the remaining segments.
    pub async fn send(
        &self,
        link: &dyn GattLink,
        assembler: &FrameAssembler,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if !assembler.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let mtu = link.mtu();
        if mtu == 0 {
            return Err(TransportError::InvalidMtu(mtu));
        }

        log::debug!("Sending {} bytes, mtu={}", data.len(), mtu);
        for (index, segment) in data.chunks(mtu).enumerate() {
            if !assembler.is_connected() {
                log::debug!("Connection lost after {} of {} bytes", index * mtu, data.len());
                return Err(TransportError::NotConnected);
            }
            link.write(self.characteristic, segment, false).await?;
        }
        log::debug!("Sent {} bytes", data.len());
        Ok(())
    }
}
