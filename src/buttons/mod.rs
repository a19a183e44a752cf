//! Button input pipeline: GPIO edge monitoring, debounce normalization and
//! gesture classification.
//!
//! One [`LineMonitor`] and one [`GestureClassifier`] exist per configured
//! line; both are owned by the [`manager`] and live exactly as long as their
//! line's current configuration generation. Lines never interact: each has
//! its own edge channel, classifier state and timers.

pub mod classifier;
pub mod manager;
pub mod monitor;

pub use classifier::{GestureClassifier, LineTimings};
pub use manager::{BindingTable, ButtonManagerHandle};
pub use monitor::LineMonitor;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// BCM line number identifying one physical input.
pub type LineId = u8;

/// Resolved meaning of one press/release interaction on a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gesture {
    Short,
    Double,
    Long,
}

impl fmt::Display for Gesture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gesture::Short => write!(f, "short"),
            Gesture::Double => write!(f, "double"),
            Gesture::Long => write!(f, "long"),
        }
    }
}

/// Logical transition direction after debounce, polarity already applied:
/// `Press` is the line reaching its active level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Press,
    Release,
}

/// Debounced press/release event for one line.
///
/// `at` is the monotonic instant used for threshold arithmetic; `timestamp`
/// is wall-clock time for operator logs.
#[derive(Debug, Clone)]
pub struct LineEdge {
    pub line: LineId,
    pub edge: Edge,
    pub at: Instant,
    pub timestamp: DateTime<Local>,
}

impl LineEdge {
    pub fn now(line: LineId, edge: Edge) -> Self {
        Self {
            line,
            edge,
            at: Instant::now(),
            timestamp: Local::now(),
        }
    }
}

/// Terminal output of classification: exactly one per interaction,
/// immutable once emitted.
#[derive(Debug, Clone)]
pub struct GestureEvent {
    pub line: LineId,
    pub gesture: Gesture,
    pub resolved_at: DateTime<Local>,
}

impl GestureEvent {
    pub fn new(line: LineId, gesture: Gesture) -> Self {
        Self {
            line,
            gesture,
            resolved_at: Local::now(),
        }
    }
}

/// Errors from the button input pipeline. None of these are fatal to the
/// process; they degrade a single line at most.
#[derive(Debug, thiserror::Error)]
pub enum ButtonError {
    /// GPIO capability missing (no gpiochip, missing driver, not a Pi).
    /// The affected monitor degrades to an inert no-op.
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("failed to send event: {0}")]
    EventSendError(String),
}
