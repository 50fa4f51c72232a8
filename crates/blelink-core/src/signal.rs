//! Signal strength smoothing.
//!
//! Raw RSSI readings jump by several dB between packets. Each device keeps a
//! short rolling history and reports the average, normalized to `0.0..=1.0`
//! against bounds shared by every device of the adapter. The bounds start at
//! the configured values and widen whenever a sample falls outside them, so
//! the scale adapts to the environment without per-device calibration.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Process-wide adaptive signal bounds.
#[derive(Debug)]
pub struct SignalBounds {
    closest: AtomicI16,
    farthest: AtomicI16,
}

impl SignalBounds {
    /// Create bounds starting at `closest` and `farthest` dBm.
    pub fn new(closest: i16, farthest: i16) -> Self {
        Self {
            closest: AtomicI16::new(closest.max(farthest)),
            farthest: AtomicI16::new(farthest.min(closest)),
        }
    }

    /// Widen the bounds to include `rssi`.
    pub fn observe(&self, rssi: i16) {
        self.closest.fetch_max(rssi, Ordering::Relaxed);
        self.farthest.fetch_min(rssi, Ordering::Relaxed);
    }

    /// Strongest signal seen so far.
    pub fn closest(&self) -> i16 {
        self.closest.load(Ordering::Relaxed)
    }

    /// Weakest signal seen so far.
    pub fn farthest(&self) -> i16 {
        self.farthest.load(Ordering::Relaxed)
    }

    /// Map an average in dBm onto `0.0..=1.0`.
    pub fn normalize(&self, average: f64) -> f64 {
        let closest = f64::from(self.closest());
        let farthest = f64::from(self.farthest());
        let span = closest - farthest;
        if span <= 0.0 {
            return if average >= closest { 1.0 } else { 0.0 };
        }
        ((average - farthest) / span).clamp(0.0, 1.0)
    }
}

impl Default for SignalBounds {
    fn default() -> Self {
        Self::new(-50, -90)
    }
}

/// Fixed-length rolling window of RSSI samples.
#[derive(Debug, Clone)]
pub struct SignalHistory {
    samples: VecDeque<i16>,
    window: usize,
}

impl SignalHistory {
    /// Create an empty history holding at most `window` samples.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Append a sample, dropping the oldest beyond the window.
    pub fn push(&mut self, rssi: i16) {
        while self.samples.len() >= self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(rssi);
    }

    /// Change the window length, dropping the oldest samples if it shrinks.
    pub fn set_window(&mut self, window: usize) {
        self.window = window.max(1);
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean of the retained samples.
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: i64 = self.samples.iter().map(|s| i64::from(*s)).sum();
        Some(sum as f64 / self.samples.len() as f64)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Smoothed signal strength of one device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalStrength {
    /// Latest raw sample in dBm.
    pub rssi: i16,
    /// Rolling average in dBm.
    pub average: f64,
    /// Average normalized against the adapter bounds.
    pub percent: f64,
}

/// Per-device smoothing state.
#[derive(Debug)]
pub struct SignalTracker {
    history: Mutex<SignalHistory>,
    connected_window: usize,
    advertising_window: usize,
}

impl SignalTracker {
    /// Create a tracker starting in the advertising window.
    pub fn new(connected_window: usize, advertising_window: usize) -> Self {
        Self {
            history: Mutex::new(SignalHistory::new(advertising_window)),
            connected_window,
            advertising_window,
        }
    }

    /// Switch between the connected and advertising windows.
    pub fn set_connected(&self, connected: bool) {
        let window = if connected {
            self.connected_window
        } else {
            self.advertising_window
        };
        self.lock().set_window(window);
    }

    /// Add a sample and compute the new smoothed strength.
    pub fn record(&self, rssi: i16, bounds: &SignalBounds) -> SignalStrength {
        bounds.observe(rssi);
        let average = {
            let mut history = self.lock();
            history.push(rssi);
            history.average().unwrap_or(f64::from(rssi))
        };
        SignalStrength {
            rssi,
            average,
            percent: bounds.normalize(average),
        }
    }

    /// Current window length.
    pub fn window(&self) -> usize {
        self.lock().window()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SignalHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
