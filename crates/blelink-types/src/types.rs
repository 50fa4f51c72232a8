//! Core value types shared between the lifecycle core and native transports.

use core::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use bytes::Bytes;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ParseError, ParseResult};

/// Platform identity of a remote device.
///
/// On Linux, Windows and Android this is the MAC address (`AA:BB:CC:DD:EE:FF`).
/// CoreBluetooth hides MAC addresses and hands out a per-host UUID instead, so
/// both forms are accepted. The textual form is normalized to upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Borrow the normalized textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parse_mac(s: &str) -> Option<[u8; 6]> {
        let mut out = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in out.iter_mut() {
            let part = parts.next()?;
            if part.len() != 2 {
                return None;
            }
            *byte = u8::from_str_radix(part, 16).ok()?;
        }
        parts.next().is_none().then_some(out)
    }
}

impl From<[u8; 6]> for DeviceAddress {
    /// `address[0]` is the most significant byte.
    fn from(a: [u8; 6]) -> Self {
        Self(format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        ))
    }
}

impl From<Uuid> for DeviceAddress {
    fn from(id: Uuid) -> Self {
        Self(id.hyphenated().to_string().to_uppercase())
    }
}

impl FromStr for DeviceAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        let s = s.trim();
        if let Some(mac) = Self::parse_mac(s) {
            return Ok(mac.into());
        }
        if let Ok(id) = Uuid::parse_str(s) {
            return Ok(id.into());
        }
        Err(ParseError::InvalidValue(format!(
            "'{}' is neither a MAC address nor a UUID",
            s
        )))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Power state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum RadioState {
    /// State not reported yet.
    #[default]
    Unknown,
    /// No usable radio on this host.
    Unsupported,
    /// The application lacks Bluetooth permission.
    Unauthorized,
    /// Radio present but switched off.
    PoweredOff,
    /// Radio ready for use.
    PoweredOn,
}

impl RadioState {
    /// Whether scans, advertising and connections can be started.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, RadioState::PoweredOn)
    }
}

bitflags! {
    /// GATT characteristic property bits as reported by the remote device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperties {
    /// The value can be read.
    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    /// The value can be written, with or without response.
    pub fn can_write(&self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }

    /// The value can be pushed by the device through notify or indicate.
    pub fn can_listen(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

/// Value of the Client Characteristic Configuration descriptor.
///
/// Two little-endian bytes; bit 0 enables notifications, bit 1 indications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ClientConfiguration {
    /// Neither notifications nor indications.
    #[default]
    Disabled,
    /// Unacknowledged notifications.
    Notify,
    /// Acknowledged indications.
    Indicate,
}

impl ClientConfiguration {
    /// Length of the encoded descriptor value.
    pub const LEN: usize = 2;

    /// Whether the device will push value changes in this configuration.
    pub fn is_listening(&self) -> bool {
        !matches!(self, ClientConfiguration::Disabled)
    }

    /// Pick the enabling configuration for the given properties, preferring notify.
    pub fn enabling(properties: CharacteristicProperties) -> Option<Self> {
        if properties.contains(CharacteristicProperties::NOTIFY) {
            Some(ClientConfiguration::Notify)
        } else if properties.contains(CharacteristicProperties::INDICATE) {
            Some(ClientConfiguration::Indicate)
        } else {
            None
        }
    }

    /// Encode as the descriptor value.
    pub fn to_bytes(self) -> [u8; 2] {
        match self {
            ClientConfiguration::Disabled => [0x00, 0x00],
            ClientConfiguration::Notify => [0x01, 0x00],
            ClientConfiguration::Indicate => [0x02, 0x00],
        }
    }

    /// Decode a descriptor value.
    ///
    /// Both bits set is reported as [`ClientConfiguration::Notify`], which is
    /// what stacks that accept the combination actually deliver.
    pub fn from_bytes(data: &[u8]) -> ParseResult<Self> {
        if data.len() < Self::LEN {
            return Err(ParseError::InsufficientBytes {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        let bits = u16::from_le_bytes([data[0], data[1]]);
        match bits & 0x0003 {
            0 => Ok(ClientConfiguration::Disabled),
            0b01 | 0b11 => Ok(ClientConfiguration::Notify),
            0b10 => Ok(ClientConfiguration::Indicate),
            _ => Err(ParseError::InvalidValue(format!(
                "client configuration 0x{:04X}",
                bits
            ))),
        }
    }
}

/// A service element as reported by native discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NativeService {
    /// Attribute handle of the service declaration (0 when the platform hides handles).
    pub handle: u16,
    /// Service UUID.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
}

impl NativeService {
    /// Create a primary service descriptor.
    pub fn new(handle: u16, uuid: Uuid) -> Self {
        Self {
            handle,
            uuid,
            primary: true,
        }
    }
}

/// A characteristic element as reported by native discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NativeCharacteristic {
    /// Attribute handle of the value (0 when the platform hides handles).
    pub handle: u16,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Property bits from the characteristic declaration.
    pub properties: CharacteristicProperties,
}

impl NativeCharacteristic {
    /// Create a characteristic descriptor.
    pub fn new(handle: u16, uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            handle,
            uuid,
            properties,
        }
    }
}

/// One received advertising event.
///
/// Created on receipt and never mutated; devices keep only the latest one.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Advertisement {
    /// When the event was received.
    pub timestamp: OffsetDateTime,
    /// Advertising device.
    pub address: DeviceAddress,
    /// Local name, when the packet carried one.
    pub name: Option<String>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Whether the device accepts connections.
    pub connectable: bool,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Advertised transmit power in dBm.
    pub tx_power: Option<i16>,
    /// Company identifier of the manufacturer data, if any.
    pub manufacturer_id: Option<u16>,
    /// Manufacturer specific payload (empty when absent).
    pub manufacturer_data: Bytes,
}

impl Advertisement {
    /// Create an advertisement stamped with the current time.
    pub fn new(address: DeviceAddress, rssi: i16) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            address,
            name: None,
            service_uuids: Vec::new(),
            connectable: true,
            rssi,
            tx_power: None,
            manufacturer_id: None,
            manufacturer_data: Bytes::new(),
        }
    }

    /// Set the local name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the advertised services.
    #[must_use]
    pub fn with_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
        self.service_uuids = services.into_iter().collect();
        self
    }

    /// Set the manufacturer data.
    #[must_use]
    pub fn with_manufacturer_data(mut self, id: u16, data: impl Into<Bytes>) -> Self {
        self.manufacturer_id = Some(id);
        self.manufacturer_data = data.into();
        self
    }

    /// Mark the advertisement as non-connectable.
    #[must_use]
    pub fn non_connectable(mut self) -> Self {
        self.connectable = false;
        self
    }

    /// Whether a given service UUID was advertised.
    pub fn advertises(&self, uuid: &Uuid) -> bool {
        self.service_uuids.contains(uuid)
    }
}
