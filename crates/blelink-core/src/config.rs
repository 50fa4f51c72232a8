//! Runtime configuration.
//!
//! [`BleConfig`] carries the default timeout of every operation kind, the
//! radio poll interval, channel capacities and the signal smoothing
//! parameters. It can be built in code or loaded from a TOML file:
//!
//! ```toml
//! radio_poll_interval_ms = 1000
//!
//! [timeouts]
//! connect_ms = 15000
//! read_ms = 5000
//!
//! [signal]
//! connected_window = 8
//! advertising_window = 3
//! ```
//!
//! Every field has a default, so any subset may be given.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entity::OperationKind;
use crate::error::{Error, Result};

/// Default timeout for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for GATT operations (read, write, listen toggle).
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for service and characteristic discovery.
pub const DEFAULT_EXPLORE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default interval between radio state polls.
pub const DEFAULT_RADIO_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Per-operation default timeouts in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub disconnect_ms: u64,
    pub explore_ms: u64,
    pub read_ms: u64,
    pub write_ms: u64,
    pub listen_ms: u64,
    pub start_ms: u64,
    pub stop_ms: u64,
    pub signal_ms: u64,
    /// How long an activity start waits for the radio to power on.
    pub radio_wait_ms: u64,
    /// Default timeout of value-change and state waits.
    pub wait_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let op = DEFAULT_OPERATION_TIMEOUT.as_millis() as u64;
        Self {
            connect_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            disconnect_ms: 5_000,
            explore_ms: DEFAULT_EXPLORE_TIMEOUT.as_millis() as u64,
            read_ms: op,
            write_ms: op,
            listen_ms: op,
            start_ms: 5_000,
            stop_ms: 5_000,
            signal_ms: 5_000,
            radio_wait_ms: 3_000,
            wait_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    /// Default timeout of an operation kind.
    pub fn get(&self, kind: OperationKind) -> Duration {
        let ms = match kind {
            OperationKind::Start => self.start_ms,
            OperationKind::Stop => self.stop_ms,
            OperationKind::Connect => self.connect_ms,
            OperationKind::Disconnect => self.disconnect_ms,
            OperationKind::Explore => self.explore_ms,
            OperationKind::Read => self.read_ms,
            OperationKind::Write => self.write_ms,
            OperationKind::ReadListening | OperationKind::WriteListening => self.listen_ms,
            OperationKind::SignalRead => self.signal_ms,
            OperationKind::RadioWait => self.radio_wait_ms,
            OperationKind::Wait => self.wait_ms,
        };
        Duration::from_millis(ms)
    }

    fn all(&self) -> [(&'static str, u64); 11] {
        [
            ("connect_ms", self.connect_ms),
            ("disconnect_ms", self.disconnect_ms),
            ("explore_ms", self.explore_ms),
            ("read_ms", self.read_ms),
            ("write_ms", self.write_ms),
            ("listen_ms", self.listen_ms),
            ("start_ms", self.start_ms),
            ("stop_ms", self.stop_ms),
            ("signal_ms", self.signal_ms),
            ("radio_wait_ms", self.radio_wait_ms),
            ("wait_ms", self.wait_ms),
        ]
    }
}

/// Signal smoothing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// History length while connected.
    pub connected_window: usize,
    /// History length while only advertising.
    pub advertising_window: usize,
    /// Initial "closest" bound in dBm.
    pub initial_closest: i16,
    /// Initial "farthest" bound in dBm.
    pub initial_farthest: i16,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            connected_window: 8,
            advertising_window: 3,
            initial_closest: -50,
            initial_farthest: -90,
        }
    }
}

/// Broadcast channel capacities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Capacity of the adapter event channel.
    pub events: usize,
    /// Capacity of each characteristic notification channel.
    pub notifications: usize,
    /// Capacity of the default failure sink.
    pub failures: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            events: 256,
            notifications: 64,
            failures: 64,
        }
    }
}

/// Configuration of an adapter and everything it creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Default operation timeouts.
    pub timeouts: TimeoutConfig,
    /// Signal smoothing.
    pub signal: SignalConfig,
    /// Channel capacities.
    pub channels: ChannelConfig,
    /// Interval between radio state polls.
    pub radio_poll_interval_ms: u64,
    /// Scanner devices without an advertisement for this long are pruned.
    pub stale_device_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            signal: SignalConfig::default(),
            channels: ChannelConfig::default(),
            radio_poll_interval_ms: DEFAULT_RADIO_POLL_INTERVAL.as_millis() as u64,
            stale_device_ms: 60_000,
        }
    }
}

impl BleConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::invalid_config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::invalid_config(format!("failed to serialize config: {}", e)))
    }

    /// Default timeout of an operation kind.
    pub fn timeout(&self, kind: OperationKind) -> Duration {
        self.timeouts.get(kind)
    }

    /// Interval between radio state polls.
    pub fn radio_poll_interval(&self) -> Duration {
        Duration::from_millis(self.radio_poll_interval_ms)
    }

    /// Age after which scanner devices are pruned.
    pub fn stale_device_after(&self) -> Duration {
        Duration::from_millis(self.stale_device_ms)
    }

    /// Set the default connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the default read, write and listen timeouts.
    #[must_use]
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        let ms = timeout.as_millis() as u64;
        self.timeouts.read_ms = ms;
        self.timeouts.write_ms = ms;
        self.timeouts.listen_ms = ms;
        self
    }

    /// Set the default explore timeout.
    #[must_use]
    pub fn explore_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.explore_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the radio poll interval.
    #[must_use]
    pub fn radio_poll_interval_of(mut self, interval: Duration) -> Self {
        self.radio_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the signal history windows.
    #[must_use]
    pub fn signal_windows(mut self, connected: usize, advertising: usize) -> Self {
        self.signal.connected_window = connected;
        self.signal.advertising_window = advertising;
        self
    }

    /// Set the event channel capacity.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.channels.events = capacity;
        self
    }

    /// Validate the configuration and return an error if invalid.
    ///
    /// Checks that:
    /// - every timeout and the poll interval are > 0
    /// - both signal windows are > 0
    /// - `initial_closest` > `initial_farthest`
    /// - every channel capacity is > 0
    pub fn validate(&self) -> Result<()> {
        for (name, ms) in self.timeouts.all() {
            if ms == 0 {
                return Err(Error::invalid_config(format!(
                    "timeouts.{} must be > 0",
                    name
                )));
            }
        }
        if self.radio_poll_interval_ms == 0 {
            return Err(Error::invalid_config("radio_poll_interval_ms must be > 0"));
        }
        if self.signal.connected_window == 0 || self.signal.advertising_window == 0 {
            return Err(Error::invalid_config("signal windows must be > 0"));
        }
        if self.signal.initial_closest <= self.signal.initial_farthest {
            return Err(Error::invalid_config(
                "signal.initial_closest must be greater than signal.initial_farthest",
            ));
        }
        if self.channels.events == 0
            || self.channels.notifications == 0
            || self.channels.failures == 0
        {
            return Err(Error::invalid_config("channel capacities must be > 0"));
        }
        Ok(())
    }
}
