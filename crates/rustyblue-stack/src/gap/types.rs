use std::fmt;
use std::str::FromStr;

/// Bluetooth device address.
///
/// `bytes` are kept in over-the-air order (least significant byte first), the
/// way they appear in HCI packets. `Display` prints the usual big-endian
/// `AA:BB:CC:DD:EE:FF` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// Error returned when parsing a textual address fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseBdAddrError;

impl fmt::Display for ParseBdAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid Bluetooth address")
    }
}

impl std::error::Error for ParseBdAddrError {}

impl FromStr for BdAddr {
    type Err = ParseBdAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for slot in (0..6).rev() {
            let part = parts.next().ok_or(ParseBdAddrError)?;
            if part.len() != 2 {
                return Err(ParseBdAddrError);
            }
            bytes[slot] = u8::from_str_radix(part, 16).map_err(|_| ParseBdAddrError)?;
        }
        if parts.next().is_some() {
            return Err(ParseBdAddrError);
        }
        Ok(Self { bytes })
    }
}

/// 128-bit BR/EDR link key
pub type LinkKey = [u8; 16];

/// Link key type as reported by the Link Key Notification event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKeyType {
    Combination,
    LocalUnit,
    RemoteUnit,
    DebugCombination,
    UnauthenticatedP192,
    AuthenticatedP192,
    ChangedCombination,
    UnauthenticatedP256,
    AuthenticatedP256,
    Unknown(u8),
}

impl From<u8> for LinkKeyType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => LinkKeyType::Combination,
            0x01 => LinkKeyType::LocalUnit,
            0x02 => LinkKeyType::RemoteUnit,
            0x03 => LinkKeyType::DebugCombination,
            0x04 => LinkKeyType::UnauthenticatedP192,
            0x05 => LinkKeyType::AuthenticatedP192,
            0x06 => LinkKeyType::ChangedCombination,
            0x07 => LinkKeyType::UnauthenticatedP256,
            0x08 => LinkKeyType::AuthenticatedP256,
            other => LinkKeyType::Unknown(other),
        }
    }
}

/// Class of Device, 24 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassOfDevice(pub u32);

impl ClassOfDevice {
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() < 3 {
            return None;
        }
        Some(Self(
            slice[0] as u32 | (slice[1] as u32) << 8 | (slice[2] as u32) << 16,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bd_addr_display_and_parse() {
        let addr = BdAddr::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(addr.to_string(), "11:22:33:44:55:66");

        let parsed: BdAddr = "11:22:33:44:55:66".parse().unwrap();
        assert_eq!(parsed, addr);

        assert!("11:22:33:44:55".parse::<BdAddr>().is_err());
        assert!("11:22:33:44:55:66:77".parse::<BdAddr>().is_err());
        assert!("zz:22:33:44:55:66".parse::<BdAddr>().is_err());
    }

    #[test]
    fn test_class_of_device() {
        let cod = ClassOfDevice::from_slice(&[0x0c, 0x02, 0x5a]).unwrap();
        assert_eq!(cod.0, 0x5a020c);
        assert!(ClassOfDevice::from_slice(&[0x00]).is_none());
    }
}
