//! SMP GATT service definition
//!
//! UUIDs of the standard SMP service and its single characteristic, plus the
//! ATT sizing constants the transport falls back on.

use uuid::Uuid;

/// Build a 128-bit UUID from the 5-field encoding used by Zephyr's
/// `BT_UUID_128_ENCODE` macro.
pub const fn uuid_from_fields(a: u32, b: u16, c: u16, d: u16, e: u64) -> Uuid {
    let hi: u64 = (a as u64) << 32 | (b as u64) << 16 | c as u64;
    let lo: u64 = (d as u64) << 48 | e;
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

/// SMP GATT service UUID.
pub const SMP_SERVICE_UUID: Uuid =
    uuid_from_fields(0x8D53DC1D, 0x1DB7, 0x4CD3, 0x868B, 0x8A527460AA84);

/// SMP characteristic UUID (write without response + notify).
pub const SMP_CHARACTERISTIC_UUID: Uuid =
    uuid_from_fields(0xDA2E7828, 0xFBCE, 0x4E01, 0xAE9E, 0x261174997C48);

/// Default ATT MTU before any exchange.
pub const DEFAULT_ATT_MTU: usize = 23;

/// ATT write command overhead (opcode + attribute handle).
pub const ATT_WRITE_OVERHEAD: usize = 3;

/// Per-write payload budget on a link that never negotiated a larger MTU.
pub const DEFAULT_WRITE_PAYLOAD: usize = DEFAULT_ATT_MTU - ATT_WRITE_OVERHEAD;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smp_uuids_match_canonical_strings() {
        assert_eq!(
            SMP_SERVICE_UUID,
            Uuid::parse_str("8D53DC1D-1DB7-4CD3-868B-8A527460AA84").unwrap()
        );
        assert_eq!(
            SMP_CHARACTERISTIC_UUID,
            Uuid::parse_str("DA2E7828-FBCE-4E01-AE9E-261174997C48").unwrap()
        );
    }

    #[test]
    fn test_default_write_payload() {
        assert_eq!(DEFAULT_WRITE_PAYLOAD, 20);
    }
}
