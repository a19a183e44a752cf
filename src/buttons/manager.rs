//! Line lifecycle management and live reconfiguration.
//!
//! The button manager owns every [`LineMonitor`]/[`GestureClassifier`] pair
//! and runs one tokio task per configured line. Each line task multiplexes
//! the line's edge channel with the classifier's timer deadline and forwards
//! resolved gestures to the dispatcher channel without ever waiting on
//! action execution.
//!
//! Reloads diff the new configuration against the running generation:
//! removed lines are cancelled (pending resolutions are abandoned, not
//! carried over), unchanged lines keep their running task and any in-flight
//! classification, and added or threshold-changed lines get fresh instances.
//! The binding table consulted by the dispatcher is published through a
//! `watch` channel in a single store, so a trigger always sees either the
//! fully-old or fully-new table.

use crate::buttons::classifier::{GestureClassifier, LineTimings};
use crate::buttons::monitor::LineMonitor;
use crate::buttons::{Edge, Gesture, GestureEvent, LineEdge, LineId};
use crate::config::{ActionBinding, ButtonsConfig, ConfigError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of each line's edge channel. Edges arrive at human speed;
/// overflow means the consumer is wedged and dropping is the right call.
const EDGE_CHANNEL_CAPACITY: usize = 64;

/// Immutable gesture-to-action table for one configuration generation.
/// Read-only once published; the dispatcher snapshots it per trigger.
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    bindings: HashMap<(LineId, Gesture), ActionBinding>,
}

impl BindingTable {
    pub fn from_config(config: &ButtonsConfig) -> Self {
        let mut bindings = HashMap::new();
        for button in &config.buttons {
            let entries = [
                (Gesture::Short, &button.bindings.short),
                (Gesture::Double, &button.bindings.double),
                (Gesture::Long, &button.bindings.long),
            ];
            for (gesture, binding) in entries {
                if let Some(binding) = binding {
                    bindings.insert((button.gpio_pin, gesture), binding.clone());
                }
            }
        }
        Self { bindings }
    }

    /// Returns the binding for `(line, gesture)`; absence means no-op.
    pub fn lookup(&self, line: LineId, gesture: Gesture) -> Option<&ActionBinding> {
        self.bindings.get(&(line, gesture))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Effective per-line runtime settings; two lines with equal settings are
/// considered unchanged across a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LineSettings {
    pin: LineId,
    timings: LineTimings,
    debounce: Duration,
}

struct LineEntry {
    settings: LineSettings,
    edge_tx: mpsc::Sender<LineEdge>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

enum ManagerCommand {
    Reload(ButtonsConfig, oneshot::Sender<Result<(), ConfigError>>),
    SimulateEdge(LineId, Edge, oneshot::Sender<bool>),
}

/// Handle to the running button manager task.
///
/// Cloneable channels only; dropping every handle shuts the manager and all
/// line tasks down.
#[derive(Debug, Clone)]
pub struct ButtonManagerHandle {
    command_tx: mpsc::Sender<ManagerCommand>,
    bindings_rx: watch::Receiver<Arc<BindingTable>>,
}

impl ButtonManagerHandle {
    /// Validates `config`, brings up the initial line generation and spawns
    /// the manager task. Resolved gestures are sent on `gesture_tx`.
    pub async fn spawn(
        config: ButtonsConfig,
        gesture_tx: mpsc::Sender<GestureEvent>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (bindings_tx, bindings_rx) = watch::channel(Arc::new(BindingTable::default()));
        let mut manager = ButtonManager {
            lines: HashMap::new(),
            generation: 0,
            gesture_tx,
            bindings_tx,
        };
        manager.apply(&config).await;

        let (command_tx, command_rx) = mpsc::channel(8);
        tokio::spawn(manager.run(command_rx));

        Ok(Self {
            command_tx,
            bindings_rx,
        })
    }

    /// Receiver over the live binding table; `borrow()` yields a consistent
    /// snapshot for one trigger.
    pub fn bindings(&self) -> watch::Receiver<Arc<BindingTable>> {
        self.bindings_rx.clone()
    }

    /// Swaps the line set and binding table to `config`. On validation
    /// failure the previous generation stays live and the error is returned.
    pub async fn reload(&self, config: ButtonsConfig) -> Result<(), ConfigError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ManagerCommand::Reload(config, reply_tx))
            .await
            .map_err(|e| ConfigError::ManagerUnavailable(e.to_string()))?;
        reply_rx
            .await
            .map_err(|e| ConfigError::ManagerUnavailable(e.to_string()))?
    }

    /// Feeds a synthetic edge into a live line, exactly as the hardware
    /// interrupt would. Used by the settings layer's test-trigger hook and
    /// by tests. Returns false if the line is not configured.
    pub async fn simulate_edge(&self, line: LineId, edge: Edge) -> Result<bool, ConfigError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ManagerCommand::SimulateEdge(line, edge, reply_tx))
            .await
            .map_err(|e| ConfigError::ManagerUnavailable(e.to_string()))?;
        reply_rx
            .await
            .map_err(|e| ConfigError::ManagerUnavailable(e.to_string()))
    }
}

struct ButtonManager {
    lines: HashMap<LineId, LineEntry>,
    generation: u64,
    gesture_tx: mpsc::Sender<GestureEvent>,
    bindings_tx: watch::Sender<Arc<BindingTable>>,
}

impl ButtonManager {
    async fn run(mut self, mut command_rx: mpsc::Receiver<ManagerCommand>) {
        debug!("button manager task started");
        while let Some(command) = command_rx.recv().await {
            match command {
                ManagerCommand::Reload(config, reply) => {
                    let result = match config.validate() {
                        Ok(()) => {
                            self.apply(&config).await;
                            Ok(())
                        }
                        Err(e) => {
                            warn!("reload rejected: {} - prior generation stays live", e);
                            Err(e)
                        }
                    };
                    let _ = reply.send(result);
                }
                ManagerCommand::SimulateEdge(line, edge, reply) => {
                    let delivered = match self.lines.get(&line) {
                        Some(entry) => entry.edge_tx.try_send(LineEdge::now(line, edge)).is_ok(),
                        None => false,
                    };
                    if !delivered {
                        debug!("simulated {:?} for unconfigured GPIO {} ignored", edge, line);
                    }
                    let _ = reply.send(delivered);
                }
            }
        }
        info!("button manager shutting down, tearing down {} line(s)", self.lines.len());
        let lines: Vec<LineId> = self.lines.keys().copied().collect();
        for line in lines {
            self.teardown_line(line).await;
        }
    }

    /// Diffs `config` against the running generation and swaps atomically
    /// from the dispatcher's point of view.
    async fn apply(&mut self, config: &ButtonsConfig) {
        self.generation += 1;

        let mut desired: HashMap<LineId, (LineSettings, String)> = HashMap::new();
        for button in &config.buttons {
            let settings = LineSettings {
                pin: button.gpio_pin,
                timings: LineTimings::from(button.resolved_timings(&config.timings)),
                debounce: button.debounce(&config.timings),
            };
            desired.insert(button.gpio_pin, (settings, button.label()));
        }

        // Tear down removed lines and lines whose settings changed. Pending
        // classifications on those lines are abandoned with the task.
        let running: Vec<LineId> = self.lines.keys().copied().collect();
        for line in running {
            let keep = matches!(
                (desired.get(&line), self.lines.get(&line)),
                (Some((settings, _)), Some(entry)) if *settings == entry.settings
            );
            if keep {
                debug!("GPIO {}: unchanged, keeping running line task", line);
            } else {
                self.teardown_line(line).await;
            }
        }

        for (line, (settings, label)) in desired {
            if !self.lines.contains_key(&line) {
                let entry = self.spawn_line(settings, label);
                self.lines.insert(line, entry);
            }
        }

        let table = Arc::new(BindingTable::from_config(config));
        let binding_count = table.len();
        self.bindings_tx.send_replace(table);
        info!(
            "configuration generation {} live: {} line(s), {} binding(s)",
            self.generation,
            self.lines.len(),
            binding_count
        );
    }

    fn spawn_line(&self, settings: LineSettings, label: String) -> LineEntry {
        let (edge_tx, edge_rx) = mpsc::channel(EDGE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let classifier = GestureClassifier::new(settings.timings);
        let monitor = LineMonitor::start(settings.pin, settings.debounce, edge_tx.clone());

        info!("starting line task for {}", label);
        let task = tokio::spawn(run_line(
            label,
            monitor,
            classifier,
            edge_rx,
            self.gesture_tx.clone(),
            cancel.clone(),
        ));

        LineEntry {
            settings,
            edge_tx,
            cancel,
            task,
        }
    }

    /// Cancels a line task and waits for it to finish so the pin is released
    /// before any replacement attaches to it.
    async fn teardown_line(&mut self, line: LineId) {
        if let Some(entry) = self.lines.remove(&line) {
            debug!("GPIO {}: tearing down line task", line);
            entry.cancel.cancel();
            if let Err(e) = entry.task.await {
                error!("GPIO {}: line task panicked: {}", line, e);
            }
        }
    }
}

/// Per-line event loop: multiplexes cancellation, the classifier's timer
/// deadline and incoming edges. Classification is a pure state transition;
/// nothing here blocks on action execution.
async fn run_line(
    label: String,
    monitor: LineMonitor,
    mut classifier: GestureClassifier,
    mut edge_rx: mpsc::Receiver<LineEdge>,
    gesture_tx: mpsc::Sender<GestureEvent>,
    cancel: CancellationToken,
) {
    let line = monitor.line();
    debug!("{}: line task running (hardware: {})", label, monitor.is_active());

    loop {
        let deadline = classifier.deadline();
        tokio::select! {
            _ = cancel.cancelled() => {
                classifier.reset();
                break;
            }
            _ = wait_deadline(deadline) => {
                if let Some(gesture) = classifier.on_timer(Instant::now()) {
                    emit(line, &label, gesture, &gesture_tx);
                }
            }
            edge = edge_rx.recv() => match edge {
                Some(event) => {
                    debug!(
                        "{}: {:?} at {}",
                        label,
                        event.edge,
                        event.timestamp.format("%H:%M:%S%.3f")
                    );
                    let resolved = match event.edge {
                        Edge::Press => classifier.on_press(event.at),
                        Edge::Release => classifier.on_release(event.at),
                    };
                    if let Some(gesture) = resolved {
                        emit(line, &label, gesture, &gesture_tx);
                    }
                }
                None => break,
            }
        }
    }
    debug!("{}: line task stopped", label);
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn emit(line: LineId, label: &str, gesture: Gesture, gesture_tx: &mpsc::Sender<GestureEvent>) {
    info!("{}: resolved {} press", label, gesture);
    if let Err(e) = gesture_tx.try_send(GestureEvent::new(line, gesture)) {
        warn!("{}: gesture dropped, dispatcher channel unavailable: {}", label, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ButtonConfig, GestureBindings, GestureTimings};
    use tokio::time::{sleep, timeout};

    fn test_config(pins: &[u8]) -> ButtonsConfig {
        ButtonsConfig {
            timings: GestureTimings::default(),
            buttons: pins
                .iter()
                .map(|&pin| ButtonConfig {
                    gpio_pin: pin,
                    id: None,
                    short_press_ms: None,
                    double_click_interval_ms: None,
                    long_press_ms: None,
                    bindings: GestureBindings {
                        short: Some(ActionBinding {
                            action: "core_trigger_refresh".to_string(),
                            parameter: None,
                        }),
                        ..GestureBindings::default()
                    },
                })
                .collect(),
        }
    }

    async fn press_release(handle: &ButtonManagerHandle, line: LineId, hold: Duration) {
        assert!(handle.simulate_edge(line, Edge::Press).await.expect("press"));
        sleep(hold).await;
        assert!(handle
            .simulate_edge(line, Edge::Release)
            .await
            .expect("release"));
    }

    async fn expect_gesture(rx: &mut mpsc::Receiver<GestureEvent>) -> GestureEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("gesture within window")
            .expect("channel open")
    }

    #[tokio::test(start_paused = true)]
    async fn short_press_flows_end_to_end() {
        let (gesture_tx, mut gesture_rx) = mpsc::channel(16);
        let handle = ButtonManagerHandle::spawn(test_config(&[17]), gesture_tx)
            .await
            .expect("spawn");

        press_release(&handle, 17, Duration::from_millis(200)).await;
        let event = expect_gesture(&mut gesture_rx).await;
        assert_eq!(event.line, 17);
        assert_eq!(event.gesture, Gesture::Short);
    }

    #[tokio::test(start_paused = true)]
    async fn long_hold_resolves_without_waiting_for_window() {
        let (gesture_tx, mut gesture_rx) = mpsc::channel(16);
        let handle = ButtonManagerHandle::spawn(test_config(&[17]), gesture_tx)
            .await
            .expect("spawn");

        press_release(&handle, 17, Duration::from_millis(1200)).await;
        // Resolves on release; no double-click window delay.
        let event = timeout(Duration::from_millis(100), gesture_rx.recv())
            .await
            .expect("eager resolution")
            .expect("channel open");
        assert_eq!(event.gesture, Gesture::Long);
    }

    #[tokio::test(start_paused = true)]
    async fn double_click_on_one_line_while_other_is_idle() {
        let (gesture_tx, mut gesture_rx) = mpsc::channel(16);
        let handle = ButtonManagerHandle::spawn(test_config(&[17, 27]), gesture_tx)
            .await
            .expect("spawn");

        press_release(&handle, 17, Duration::from_millis(150)).await;
        sleep(Duration::from_millis(200)).await;
        press_release(&handle, 17, Duration::from_millis(150)).await;

        let event = expect_gesture(&mut gesture_rx).await;
        assert_eq!(event.line, 17);
        assert_eq!(event.gesture, Gesture::Double);
        // Exactly one gesture for the whole interaction.
        assert!(gesture_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reload_preserves_pending_state_on_untouched_line() {
        let (gesture_tx, mut gesture_rx) = mpsc::channel(16);
        let handle = ButtonManagerHandle::spawn(test_config(&[17, 27]), gesture_tx)
            .await
            .expect("spawn");

        // Line 27 enters AWAITING_SECOND.
        press_release(&handle, 27, Duration::from_millis(100)).await;

        // Reload changes line 17's thresholds only.
        let mut config = test_config(&[17, 27]);
        config.buttons[0].long_press_ms = Some(2000);
        handle.reload(config).await.expect("reload");

        // Line 27's pending short still resolves from the preserved state.
        let event = expect_gesture(&mut gesture_rx).await;
        assert_eq!(event.line, 27);
        assert_eq!(event.gesture, Gesture::Short);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_line_abandons_pending_resolution() {
        let (gesture_tx, mut gesture_rx) = mpsc::channel(16);
        let handle = ButtonManagerHandle::spawn(test_config(&[17, 27]), gesture_tx)
            .await
            .expect("spawn");

        press_release(&handle, 17, Duration::from_millis(100)).await;
        handle.reload(test_config(&[27])).await.expect("reload");

        // The pending short on line 17 must never fire.
        let outcome = timeout(Duration::from_secs(2), gesture_rx.recv()).await;
        assert!(outcome.is_err(), "abandoned line produced {:?}", outcome);

        // And the removed line no longer accepts edges.
        assert!(!handle.simulate_edge(17, Edge::Press).await.expect("send"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_reload_keeps_prior_generation() {
        let (gesture_tx, mut gesture_rx) = mpsc::channel(16);
        let handle = ButtonManagerHandle::spawn(test_config(&[17]), gesture_tx)
            .await
            .expect("spawn");

        let err = handle.reload(test_config(&[17, 17])).await;
        assert!(matches!(err, Err(ConfigError::DuplicateLine(17))));

        // Prior generation still classifies.
        press_release(&handle, 17, Duration::from_millis(200)).await;
        let event = expect_gesture(&mut gesture_rx).await;
        assert_eq!(event.gesture, Gesture::Short);
    }

    #[test]
    fn binding_table_lookup() {
        let config = test_config(&[17]);
        let table = BindingTable::from_config(&config);
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.lookup(17, Gesture::Short).map(|b| b.action.as_str()),
            Some("core_trigger_refresh")
        );
        assert!(table.lookup(17, Gesture::Long).is_none());
        assert!(table.lookup(27, Gesture::Short).is_none());
    }
}
