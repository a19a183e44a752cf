//! Per-line gesture classification state machine.
//!
//! Converts a press/release pair (plus a possible follow-up press) into
//! exactly one [`Gesture`], or discards the interaction as noise. The
//! classifier is a pure in-memory state transition: every entry point
//! returns immediately, so it can be driven from the edge path without ever
//! blocking it. Timer expiry is handled by the owning line task, which asks
//! [`GestureClassifier::deadline`] for the next instant it must wake up at.
//!
//! ```text
//! IDLE ──press──► PRESSED ──release──┬─ hold >= long_min ─► emit LONG ─► IDLE
//!                                    ├─ hold > short_max ─► discard ─► IDLE
//!                                    └─ else ─► AWAITING_SECOND (timer armed)
//! AWAITING_SECOND ──press before timer──► SECOND_PRESSED
//!                 ──timer fires────────► emit SHORT ─► IDLE
//! SECOND_PRESSED  ──release────────────► emit DOUBLE ─► IDLE
//!                 ──stuck bound────────► discard ─► IDLE
//! ```

use crate::buttons::Gesture;
use crate::config::GestureTimings;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Upper safety bound on the second press of a double click. A press held
/// longer than this without a release is treated as stuck input and the
/// interaction is discarded, so the classifier can never wedge permanently.
pub const STUCK_RELEASE_BOUND: Duration = Duration::from_secs(30);

/// Effective thresholds for one line, resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTimings {
    /// Hold durations at or below this are short-press candidates.
    pub short_max: Duration,
    /// Window after the first release in which a second press counts.
    pub double_interval_max: Duration,
    /// Hold durations at or above this resolve as a long press.
    pub long_min: Duration,
}

impl From<GestureTimings> for LineTimings {
    fn from(t: GestureTimings) -> Self {
        Self {
            short_max: Duration::from_millis(t.short_press_ms),
            double_interval_max: Duration::from_millis(t.double_click_interval_ms),
            long_min: Duration::from_millis(t.long_press_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Pressed { pressed_at: Instant },
    AwaitingSecond { deadline: Instant },
    SecondPressed { pressed_at: Instant },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Idle => "IDLE",
            State::Pressed { .. } => "PRESSED",
            State::AwaitingSecond { .. } => "AWAITING_SECOND",
            State::SecondPressed { .. } => "SECOND_PRESSED",
        }
    }
}

/// Timed state machine resolving debounced press/release events into
/// gestures. One instance per line; instances share nothing.
#[derive(Debug)]
pub struct GestureClassifier {
    timings: LineTimings,
    state: State,
}

impl GestureClassifier {
    pub fn new(timings: LineTimings) -> Self {
        Self {
            timings,
            state: State::Idle,
        }
    }

    pub fn timings(&self) -> &LineTimings {
        &self.timings
    }

    /// True while no interaction is in flight.
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Next instant at which [`Self::on_timer`] must be called, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            State::AwaitingSecond { deadline } => Some(deadline),
            State::SecondPressed { pressed_at } => Some(pressed_at + STUCK_RELEASE_BOUND),
            _ => None,
        }
    }

    /// Feeds a press event. May resolve a gesture when the press lands on an
    /// already-expired double-click window (the timer fires first, then the
    /// press opens a new interaction).
    pub fn on_press(&mut self, at: Instant) -> Option<Gesture> {
        match self.state {
            State::Idle => {
                self.state = State::Pressed { pressed_at: at };
                None
            }
            State::AwaitingSecond { deadline } => {
                if at < deadline {
                    // Second press strictly inside the window.
                    self.state = State::SecondPressed { pressed_at: at };
                    None
                } else {
                    // Timer boundary already passed: resolve the pending
                    // short first, this press starts a fresh interaction.
                    debug!("press at expired double window -> SHORT, new interaction");
                    self.state = State::Pressed { pressed_at: at };
                    Some(Gesture::Short)
                }
            }
            // Repeated press without a release in between; the monitor
            // normally collapses these, ignore defensively.
            State::Pressed { .. } | State::SecondPressed { .. } => {
                debug!("duplicate press in {} ignored", self.state.name());
                None
            }
        }
    }

    /// Feeds a release event. Resolves LONG eagerly, DOUBLE on the second
    /// release, discards holds past the short threshold that fall short of
    /// a long press, and arms the double-click window otherwise.
    pub fn on_release(&mut self, at: Instant) -> Option<Gesture> {
        match self.state {
            State::Pressed { pressed_at } => {
                let hold = at.saturating_duration_since(pressed_at);
                if hold >= self.timings.long_min {
                    // A long hold always resolves immediately, no waiting
                    // for a second click.
                    self.state = State::Idle;
                    Some(Gesture::Long)
                } else if hold > self.timings.short_max {
                    // Too long for a short candidate, too brief for a long
                    // press: the interaction carries no gesture and the
                    // double window is never armed.
                    debug!("hold {:?} past short threshold, discarded", hold);
                    self.state = State::Idle;
                    None
                } else {
                    self.state = State::AwaitingSecond {
                        deadline: at + self.timings.double_interval_max,
                    };
                    None
                }
            }
            State::SecondPressed { .. } => {
                // Double click regardless of the second press's own hold.
                self.state = State::Idle;
                Some(Gesture::Double)
            }
            State::Idle | State::AwaitingSecond { .. } => {
                debug!("stray release in {} ignored", self.state.name());
                None
            }
        }
    }

    /// Called by the owning task once `now` reaches [`Self::deadline`].
    /// Resolves SHORT at double-window expiry and clears stuck input.
    pub fn on_timer(&mut self, now: Instant) -> Option<Gesture> {
        match self.state {
            State::AwaitingSecond { deadline } if now >= deadline => {
                self.state = State::Idle;
                Some(Gesture::Short)
            }
            State::SecondPressed { pressed_at } if now >= pressed_at + STUCK_RELEASE_BOUND => {
                debug!("no release within stuck bound, discarding interaction");
                self.state = State::Idle;
                None
            }
            _ => None,
        }
    }

    /// Abandons any in-flight interaction. Used on line teardown so a
    /// pending resolution can never fire after its generation is gone.
    pub fn reset(&mut self) {
        if self.state != State::Idle {
            debug!("classifier reset from {}", self.state.name());
            self.state = State::Idle;
        }
    }
}
