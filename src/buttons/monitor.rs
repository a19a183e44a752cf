//! GPIO line monitoring via rppal async interrupts.
//!
//! A [`LineMonitor`] normalizes raw edge callbacks into timestamped logical
//! press/release events: polarity is applied (active-low with internal
//! pull-up), transitions shorter than the debounce window are discarded by
//! the kernel-side filter, and repeated same-direction edges are collapsed.
//! Events are forwarded with a non-blocking `try_send` so the interrupt
//! thread is never stalled by a slow consumer.
//!
//! When the GPIO capability is missing (not a Pi, missing driver), the
//! monitor degrades to an inert no-op that emits nothing; this is logged
//! once at creation and leaves the rest of the system operating.

use crate::buttons::{ButtonError, Edge, LineEdge, LineId};
use rppal::gpio::{Gpio, InputPin, Trigger};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Monitors one physical input line and feeds debounced edges into the
/// line's event channel. Dropping the monitor clears the interrupt and
/// releases the pin.
#[derive(Debug)]
pub struct LineMonitor {
    line: LineId,
    pin: Option<InputPin>,
}

impl LineMonitor {
    /// Attaches to the given BCM line. On hardware failure the returned
    /// monitor is inert rather than an error: a missing GPIO capability
    /// degrades the line, never the process.
    pub fn start(line: LineId, debounce: Duration, edge_tx: mpsc::Sender<LineEdge>) -> Self {
        match Self::attach(line, debounce, edge_tx) {
            Ok(pin) => {
                info!("GPIO {}: monitoring with {:?} debounce", line, debounce);
                Self {
                    line,
                    pin: Some(pin),
                }
            }
            Err(e) => {
                warn!("GPIO {}: {} - line monitor is inert", line, e);
                Self { line, pin: None }
            }
        }
    }

    fn attach(
        line: LineId,
        debounce: Duration,
        edge_tx: mpsc::Sender<LineEdge>,
    ) -> Result<InputPin, ButtonError> {
        let gpio = Gpio::new().map_err(|e| ButtonError::HardwareUnavailable(e.to_string()))?;
        let mut pin = gpio
            .get(line)
            .map_err(|e| ButtonError::HardwareUnavailable(e.to_string()))?
            .into_input_pullup();

        let mut last_edge: Option<Edge> = None;
        pin.set_async_interrupt(Trigger::Both, Some(debounce), move |event| {
            // Active-low: falling edge is the press.
            let edge = match event.trigger {
                Trigger::FallingEdge => Edge::Press,
                Trigger::RisingEdge => Edge::Release,
                _ => return,
            };
            // Collapse repeated same-direction edges left over from bounce.
            if last_edge == Some(edge) {
                debug!("GPIO {}: repeated {:?} edge collapsed", line, edge);
                return;
            }
            last_edge = Some(edge);

            if let Err(e) = edge_tx.try_send(LineEdge::now(line, edge)) {
                warn!("GPIO {}: edge dropped, channel unavailable: {}", line, e);
            }
        })
        .map_err(|e| ButtonError::HardwareUnavailable(e.to_string()))?;

        Ok(pin)
    }

    pub fn line(&self) -> LineId {
        self.line
    }

    /// False when the monitor degraded to a no-op at creation.
    pub fn is_active(&self) -> bool {
        self.pin.is_some()
    }
}
