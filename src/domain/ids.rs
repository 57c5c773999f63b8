//! Identifier conversions
//!
//! Text and binary forms of the identifiers that key the connection cache:
//! 128-bit GATT UUIDs and 48-bit Bluetooth addresses.

use crate::domain::error::BleError;
use uuid::Uuid;

/// Characteristic User Description descriptor (0x2901)
pub const USER_DESCRIPTION_UUID: Uuid = Uuid::from_u128(0x00002901_0000_1000_8000_00805f9b34fb);

/// Position in the GUID memory layout of each textual byte.
const GUID_BYTE_ORDER: [usize; 16] = [3, 2, 1, 0, 5, 4, 7, 6, 8, 9, 10, 11, 12, 13, 14, 15];

const MAC_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Parse a UUID string (hyphenated, braced or bare hex, any case).
///
/// Characters that are not hex digits are skipped rather than rejected, and
/// input with fewer than 32 digits leaves the remaining bytes zero. Hosts have
/// always been able to pass loosely formatted identifiers, so this leniency is
/// kept; use [`Uuid::parse_str`] where strict validation is wanted.
pub fn parse_uuid(text: &str) -> Uuid {
    let mut guid = [0u8; 16];

    let digits = text.chars().filter_map(|c| c.to_digit(16)).take(32);
    for (offset, digit) in digits.enumerate() {
        let slot = &mut guid[GUID_BYTE_ORDER[offset / 2]];
        if offset % 2 == 0 {
            *slot |= (digit as u8) << 4;
        } else {
            *slot |= digit as u8;
        }
    }

    uuid_from_guid_bytes(guid)
}

/// Lowercase hyphenated form, e.g. `0000180f-0000-1000-8000-00805f9b34fb`
pub fn uuid_to_text(id: &Uuid) -> String {
    id.hyphenated().to_string()
}

/// Bytes of `id` in Windows GUID memory layout.
pub fn guid_bytes(id: &Uuid) -> [u8; 16] {
    id.to_bytes_le()
}

pub fn uuid_from_guid_bytes(bytes: [u8; 16]) -> Uuid {
    Uuid::from_bytes_le(bytes)
}

/// Convert a `AA:BB:CC:DD:EE:FF` style address into its integer value.
///
/// Colons are stripped and the leading run of hex digits is parsed. Malformed
/// input yields 0, matching what hosts have always received for addresses the
/// OS reports in an unexpected shape. See [`try_parse_mac`] for the strict form.
pub fn mac_text_to_integer(text: &str) -> u64 {
    let stripped: String = text.trim().chars().filter(|c| *c != ':').collect();
    let digits: String = stripped
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();

    u64::from_str_radix(&digits, 16)
        .map(|value| value & MAC_MASK)
        .unwrap_or(0)
}

/// Strictly parse six colon separated octets.
pub fn try_parse_mac(text: &str) -> Result<u64, BleError> {
    let invalid = || BleError::InvalidIdentifier(text.to_string());

    let octets: Vec<&str> = text.trim().split(':').collect();
    if octets.len() != 6 {
        return Err(invalid());
    }

    octets.iter().try_fold(0u64, |acc, octet| {
        if octet.len() != 2 {
            return Err(invalid());
        }
        let byte = u8::from_str_radix(octet, 16).map_err(|_| invalid())?;
        Ok((acc << 8) | byte as u64)
    })
}

pub fn format_mac(address: u64) -> String {
    let bytes = (address & MAC_MASK).to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
