//! # gestured - GPIO pushbutton gesture daemon
//!
//! Classifies noisy GPIO edge transitions into discrete gestures (short press,
//! double click, long press) per input line and dispatches the bound action for
//! each resolved gesture under a system-wide single-flight guarantee.
//!
//! ## Architecture
//!
//! ```text
//! hardware edge ──► LineMonitor ──► press/release ──► GestureClassifier
//!                   (per line)      (edge channel)     (per-line task)
//!                                                           │
//!                                                     GestureEvent
//!                                                           ▼
//!                   ActionRegistry ◄── lookup ──── Dispatcher ──► action execution
//!                                                           ▲      (single-flight,
//!                   ButtonManager ── binding table ─────────┘       per-class timeout)
//!                   (config reload, line lifecycle)
//! ```
//!
//! Classification is pure in-memory state transition and never waits on action
//! execution; actions run on their own task behind a one-permit semaphore.

pub mod actions;
pub mod buttons;
pub mod config;
