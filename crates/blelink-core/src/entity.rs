//! Identity of entities and the kinds of operations they run.
//!
//! Every event, log line, metric and error carries an [`EntityKey`], so a
//! consumer can route by (entity, field) without any runtime name lookup.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use blelink_types::DeviceAddress;
use blelink_types::uuids::to_short_string;

/// Kind of long-lived object managed by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// The local radio and root object.
    Adapter,
    /// Discovery activity.
    Scanner,
    /// Advertising activity.
    Broadcaster,
    /// Remote peripheral.
    Device,
    /// GATT service on a device.
    Service,
    /// GATT characteristic on a service.
    Characteristic,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Adapter => "adapter",
            EntityKind::Scanner => "scanner",
            EntityKind::Broadcaster => "broadcaster",
            EntityKind::Device => "device",
            EntityKind::Service => "service",
            EntityKind::Characteristic => "characteristic",
        };
        f.write_str(name)
    }
}

/// Stable key of one entity instance.
///
/// Child keys embed the parent path: `AA:BB:CC:DD:EE:FF/0x180f@12/0x2a19@14`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// What kind of entity this is.
    pub kind: EntityKind,
    /// Path-like identifier, unique per adapter.
    pub id: String,
}

impl EntityKey {
    /// Create a key from parts.
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Key of a device.
    pub fn device(address: &DeviceAddress) -> Self {
        Self::new(EntityKind::Device, address.as_str())
    }

    /// Key of an attribute (service or characteristic) below `parent`.
    pub fn child(&self, kind: EntityKind, uuid: &Uuid, handle: u16) -> Self {
        Self::new(
            kind,
            format!("{}/{}@{}", self.id, to_short_string(uuid), handle),
        )
    }

    /// Whether `self` is `other` or lives below it.
    pub fn is_within(&self, other: &EntityKey) -> bool {
        self.id == other.id
            || (self.id.starts_with(&other.id) && self.id[other.id.len()..].starts_with('/'))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// One kind of tracked asynchronous operation.
///
/// At most one operation handle per (entity, kind) pair is current at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum OperationKind {
    Start,
    Stop,
    Connect,
    Disconnect,
    Explore,
    Read,
    Write,
    ReadListening,
    WriteListening,
    SignalRead,
    RadioWait,
    /// Waiting for a state change or notification.
    Wait,
}

impl OperationKind {
    /// Number of kinds.
    pub const COUNT: usize = 12;

    /// All kinds, in declaration order.
    pub const ALL: [OperationKind; Self::COUNT] = [
        OperationKind::Start,
        OperationKind::Stop,
        OperationKind::Connect,
        OperationKind::Disconnect,
        OperationKind::Explore,
        OperationKind::Read,
        OperationKind::Write,
        OperationKind::ReadListening,
        OperationKind::WriteListening,
        OperationKind::SignalRead,
        OperationKind::RadioWait,
        OperationKind::Wait,
    ];

    /// Position in [`OperationKind::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Short lowercase name used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::Explore => "explore",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::ReadListening => "read listening",
            OperationKind::WriteListening => "write listening",
            OperationKind::SignalRead => "signal read",
            OperationKind::RadioWait => "radio wait",
            OperationKind::Wait => "wait",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
