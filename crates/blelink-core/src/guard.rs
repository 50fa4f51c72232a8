//! Connection guard for automatic disconnect on drop.
//!
//! This module provides RAII-style connection management, ensuring that a
//! connection is closed when the guard goes out of scope.

use std::ops::Deref;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::warn;

use crate::device::Device;
use crate::error::Result;

/// A guard that disconnects the device when dropped.
///
/// Dropping spawns the disconnect on the current Tokio runtime; without a
/// runtime the device stays connected and a warning is logged.
///
/// # Example
///
/// ```ignore
/// use blelink_core::ConnectionGuard;
///
/// let device = adapter.device(&address);
/// let guard = ConnectionGuard::connect(device).await?;
/// guard.explore().await?;
/// // Disconnected here.
/// ```
pub struct ConnectionGuard {
    device: Arc<Device>,
    armed: bool,
}

impl ConnectionGuard {
    /// Guard an already connected device.
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            armed: true,
        }
    }

    /// Connect if needed, then guard the connection.
    pub async fn connect(device: Arc<Device>) -> Result<Self> {
        device.connect_if_needed().await?;
        Ok(Self::new(device))
    }

    /// Give up the guard without disconnecting.
    ///
    /// After calling this, you are responsible for disconnecting the device.
    pub fn into_inner(mut self) -> Arc<Device> {
        self.armed = false;
        Arc::clone(&self.device)
    }

    /// Get a reference to the device.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Deref for ConnectionGuard {
    type Target = Device;

    fn deref(&self) -> &Self::Target {
        &self.device
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let device = Arc::clone(&self.device);
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = device.disconnect_if_needed().await {
                    warn!("Failed to disconnect {} in guard drop: {}", device.address(), e);
                }
            });
        } else {
            warn!(
                "No tokio runtime available to disconnect {} in guard drop",
                self.device.address()
            );
        }
    }
}
