//! Device identity: the 8-byte BCD terminal ID, rendered as uppercase hex.

use std::fmt;

/// Uniquely names a device across reconnects. Rendered as 16 uppercase hex
/// chars; leading zero preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity([u8; 8]);

impl DeviceIdentity {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_uppercase_hex_with_leading_zero() {
        let id = DeviceIdentity::from_bytes([0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45]);
        assert_eq!(id.as_hex(), "0123456789012345");
    }

    #[test]
    fn equal_bytes_are_equal_identity() {
        let a = DeviceIdentity::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let b = DeviceIdentity::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(a, b);
    }
}
