//! Platform-agnostic value types for the blelink BLE client.
//!
//! This crate holds the plain data that flows between application code, the
//! lifecycle core (`blelink-core`) and platform transports: device addresses,
//! advertisements, native discovery results, characteristic property bits and
//! the client configuration descriptor value.
//!
//! # Example
//!
//! ```
//! use blelink_types::{ClientConfiguration, DeviceAddress};
//!
//! let address: DeviceAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
//! assert_eq!(address.as_str(), "AA:BB:CC:DD:EE:FF");
//! assert_eq!(ClientConfiguration::Notify.to_bytes(), [0x01, 0x00]);
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{
    Advertisement, CharacteristicProperties, ClientConfiguration, DeviceAddress,
    NativeCharacteristic, NativeService, RadioState,
};
pub use self::uuid as uuids;
