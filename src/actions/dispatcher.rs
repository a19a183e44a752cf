//! Gesture-to-action dispatch with a system-wide single-flight guarantee.
//!
//! ## Design Rationale
//!
//! The dispatcher is the only consumer of resolved gestures. Per trigger it
//! snapshots the live binding table, resolves the bound action id against
//! the registry and built-ins, and executes on a spawned task under a
//! per-class timeout. A one-permit semaphore enforces single-flight: while
//! any action runs, further triggers are dropped with a log line, never
//! queued. Slow actions therefore cost at most one stale execution, and a
//! burst of presses during a 30 s script cannot replay afterwards.
//!
//! Classification never waits on this module: the gesture channel is fed
//! with `try_send` upstream and drained here even while an action runs.

use crate::actions::builtin::{self, SystemAction};
use crate::actions::registry::ActionRegistry;
use crate::actions::{
    ActionCallback, ActionError, ActionRefs, DisplayContext, RefreshRequest,
};
use crate::buttons::{BindingTable, GestureEvent};
use crate::config::ActionBinding;
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Outcome of one action execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

/// Record of one admitted execution. Tickets exist for logging and
/// inspection; holding one does not keep the action alive.
#[derive(Debug, Clone)]
pub struct ExecutionTicket {
    pub id: u64,
    pub action: String,
    pub started_at: DateTime<Local>,
    pub timeout: Duration,
    pub status: TicketStatus,
}

impl ExecutionTicket {
    fn new(id: u64, action: String, timeout: Duration) -> Self {
        Self {
            id,
            action,
            started_at: Local::now(),
            timeout,
            status: TicketStatus::Running,
        }
    }
}

/// Binding resolved to something executable, with its timeout class.
enum ResolvedAction {
    Refresh(RefreshRequest),
    System(SystemAction),
    Script(Option<String>),
    Url(Option<String>),
    Callback {
        id: String,
        callback: ActionCallback,
        display: Option<DisplayContext>,
    },
}

impl ResolvedAction {
    fn timeout(&self) -> Duration {
        match self {
            ResolvedAction::Refresh(_) | ResolvedAction::System(_) => builtin::SYSTEM_TIMEOUT,
            ResolvedAction::Script(_) => builtin::SCRIPT_TIMEOUT,
            ResolvedAction::Url(_) => builtin::URL_TIMEOUT,
            ResolvedAction::Callback { .. } => builtin::CALLBACK_TIMEOUT,
        }
    }

    fn describe(&self) -> String {
        match self {
            ResolvedAction::Refresh(request) => format!("refresh:{:?}", request),
            ResolvedAction::System(action) => format!("system:{:?}", action),
            ResolvedAction::Script(_) => "external_script".to_string(),
            ResolvedAction::Url(_) => "call_url".to_string(),
            ResolvedAction::Callback { id, .. } => id.clone(),
        }
    }
}

/// Consumes gesture events and executes bound actions one at a time.
pub struct Dispatcher {
    gesture_rx: mpsc::Receiver<GestureEvent>,
    bindings: watch::Receiver<Arc<BindingTable>>,
    display: watch::Receiver<Option<DisplayContext>>,
    registry: Arc<ActionRegistry>,
    refs: ActionRefs,
    flight: Arc<Semaphore>,
    next_ticket: u64,
}

impl Dispatcher {
    pub fn new(
        gesture_rx: mpsc::Receiver<GestureEvent>,
        bindings: watch::Receiver<Arc<BindingTable>>,
        display: watch::Receiver<Option<DisplayContext>>,
        registry: Arc<ActionRegistry>,
        refs: ActionRefs,
    ) -> Self {
        Self {
            gesture_rx,
            bindings,
            display,
            registry,
            refs,
            flight: Arc::new(Semaphore::new(1)),
            next_ticket: 0,
        }
    }

    /// Dispatch loop; runs until every gesture sender is gone.
    pub async fn run(mut self) {
        info!("action dispatcher running");
        while let Some(event) = self.gesture_rx.recv().await {
            self.handle(event);
        }
        info!("action dispatcher stopped, gesture channel closed");
    }

    fn handle(&mut self, event: GestureEvent) {
        // One consistent snapshot per trigger; a concurrent reload affects
        // only subsequent triggers.
        let binding = self
            .bindings
            .borrow()
            .lookup(event.line, event.gesture)
            .cloned();
        let Some(binding) = binding else {
            debug!(
                "GPIO {}: no action bound for {} press",
                event.line, event.gesture
            );
            return;
        };

        let resolved = match self.resolve(&binding) {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    "GPIO {}: {} press dropped: {}",
                    event.line, event.gesture, e
                );
                return;
            }
        };

        let permit = match Arc::clone(&self.flight).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "GPIO {}: {} press dropped, an action is already in flight",
                    event.line, event.gesture
                );
                return;
            }
        };

        self.next_ticket += 1;
        let ticket = ExecutionTicket::new(self.next_ticket, resolved.describe(), resolved.timeout());
        info!(
            "ticket {}: {} press on GPIO {} -> {} ({:?} limit)",
            ticket.id, event.gesture, event.line, ticket.action, ticket.timeout
        );

        let refs = self.refs.clone();
        tokio::spawn(async move {
            let finished = execute_ticket(ticket, resolved, refs).await;
            match finished.status {
                TicketStatus::Succeeded => {
                    info!("ticket {}: {} succeeded", finished.id, finished.action)
                }
                TicketStatus::TimedOut => error!(
                    "ticket {}: {} exceeded its {:?} limit and was terminated",
                    finished.id, finished.action, finished.timeout
                ),
                _ => warn!("ticket {}: {} failed", finished.id, finished.action),
            }
            // Releasing the permit re-opens dispatch.
            drop(permit);
        });
    }

    /// Resolves a binding to an executable action. `Ok(None)` is a logged
    /// no-op: unbound placeholder ids and display actions with no matching
    /// display context.
    fn resolve(&self, binding: &ActionBinding) -> Result<Option<ResolvedAction>, ActionError> {
        let action_id = binding.action.trim();
        if action_id.is_empty() || action_id == "none" {
            debug!("binding holds no action, ignoring trigger");
            return Ok(None);
        }

        if let Some(request) = builtin::refresh_request_for(action_id) {
            return Ok(Some(ResolvedAction::Refresh(request)));
        }
        if let Some(system) = SystemAction::from_action_id(action_id) {
            return Ok(Some(ResolvedAction::System(system)));
        }
        if action_id == "external_script" {
            return Ok(Some(ResolvedAction::Script(binding.parameter.clone())));
        }
        if action_id == "call_url" {
            return Ok(Some(ResolvedAction::Url(binding.parameter.clone())));
        }

        if let Some(index) = action_id.strip_prefix("display_action_") {
            let index: usize = index.parse().map_err(|_| {
                ActionError::InvalidParameter(format!("malformed display action id: {}", action_id))
            })?;
            let Some(context) = self.display.borrow().clone() else {
                info!("{}: nothing displayed, trigger ignored", action_id);
                return Ok(None);
            };
            let callback = self.registry.resolve_display(&context.plugin_id, index)?;
            return Ok(Some(ResolvedAction::Callback {
                id: format!("{}@{}", action_id, context.plugin_id),
                callback,
                display: Some(context),
            }));
        }

        let descriptor = self.registry.resolve(action_id)?;
        Ok(Some(ResolvedAction::Callback {
            id: descriptor.id,
            callback: descriptor.callback,
            display: None,
        }))
    }
}

/// Runs one admitted action under its timeout class and returns the ticket
/// in its terminal status.
async fn execute_ticket(
    mut ticket: ExecutionTicket,
    action: ResolvedAction,
    refs: ActionRefs,
) -> ExecutionTicket {
    let window = ticket.timeout;
    ticket.status = match tokio::time::timeout(window, run_action(action, refs)).await {
        Ok(Ok(())) => TicketStatus::Succeeded,
        Ok(Err(e)) => {
            warn!("ticket {}: {}", ticket.id, e);
            TicketStatus::Failed
        }
        // Timing out drops the execution future, which kills any subprocess
        // it spawned.
        Err(_) => TicketStatus::TimedOut,
    };
    ticket
}

async fn run_action(action: ResolvedAction, mut refs: ActionRefs) -> Result<(), ActionError> {
    match action {
        ResolvedAction::Refresh(request) => refs.refresh.request(request),
        ResolvedAction::System(system) => builtin::run_system_command(system, &refs.app).await,
        ResolvedAction::Script(parameter) => {
            builtin::run_external_script(parameter.as_deref()).await
        }
        ResolvedAction::Url(parameter) => builtin::call_url(parameter.as_deref()).await,
        ResolvedAction::Callback {
            callback, display, ..
        } => {
            refs.current_display = display;
            (callback)(refs)
                .await
                .map_err(|e| ActionError::ExecutionFailed(format!("{:#}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::registry::AnytimeSpec;
    use crate::actions::{callback, AppHandle, DeviceHandle, RefreshHandle};
    use crate::buttons::{Gesture, LineId};
    use crate::config::{ButtonConfig, ButtonsConfig, GestureBindings, GestureTimings};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    fn table_for(entries: &[(LineId, Gesture, &str)]) -> Arc<BindingTable> {
        let mut buttons: HashMap<LineId, ButtonConfig> = HashMap::new();
        for &(line, gesture, action) in entries {
            let button = buttons.entry(line).or_insert_with(|| ButtonConfig {
                gpio_pin: line,
                id: None,
                short_press_ms: None,
                double_click_interval_ms: None,
                long_press_ms: None,
                bindings: GestureBindings::default(),
            });
            let binding = Some(ActionBinding {
                action: action.to_string(),
                parameter: None,
            });
            match gesture {
                Gesture::Short => button.bindings.short = binding,
                Gesture::Double => button.bindings.double = binding,
                Gesture::Long => button.bindings.long = binding,
            }
        }
        let config = ButtonsConfig {
            timings: GestureTimings::default(),
            buttons: buttons.into_values().collect(),
        };
        Arc::new(BindingTable::from_config(&config))
    }

    struct Harness {
        gesture_tx: mpsc::Sender<GestureEvent>,
        refresh_rx: mpsc::Receiver<RefreshRequest>,
        display_tx: watch::Sender<Option<DisplayContext>>,
        _bindings_tx: watch::Sender<Arc<BindingTable>>,
    }

    fn spawn_dispatcher(registry: Arc<ActionRegistry>, table: Arc<BindingTable>) -> Harness {
        let (gesture_tx, gesture_rx) = mpsc::channel(16);
        let (refresh_tx, refresh_rx) = mpsc::channel(16);
        let (bindings_tx, bindings_rx) = watch::channel(table);
        let (display_tx, display_rx) = watch::channel(None);
        let refs = ActionRefs {
            device: DeviceHandle::default(),
            refresh: RefreshHandle::new(refresh_tx),
            app: AppHandle::default(),
            current_display: None,
        };
        let dispatcher = Dispatcher::new(gesture_rx, bindings_rx, display_rx, registry, refs);
        tokio::spawn(dispatcher.run());
        Harness {
            gesture_tx,
            refresh_rx,
            display_tx,
            _bindings_tx: bindings_tx,
        }
    }

    async fn trigger(harness: &Harness, line: LineId, gesture: Gesture) {
        harness
            .gesture_tx
            .send(GestureEvent::new(line, gesture))
            .await
            .expect("dispatcher alive");
        // Let the dispatcher drain the channel.
        sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_binding_sends_host_request() {
        let registry = Arc::new(ActionRegistry::new());
        let table = table_for(&[
            (17, Gesture::Short, "core_trigger_refresh"),
            (17, Gesture::Double, "core_prev_playlist"),
        ]);
        let mut harness = spawn_dispatcher(registry, table);

        trigger(&harness, 17, Gesture::Short).await;
        let request = timeout(Duration::from_secs(1), harness.refresh_rx.recv())
            .await
            .expect("request in time")
            .expect("channel open");
        assert_eq!(request, RefreshRequest::Advance);

        trigger(&harness, 17, Gesture::Double).await;
        let request = timeout(Duration::from_secs(1), harness.refresh_rx.recv())
            .await
            .expect("request in time")
            .expect("channel open");
        assert_eq!(request, RefreshRequest::Previous);
    }

    #[tokio::test(start_paused = true)]
    async fn second_trigger_is_dropped_while_action_runs() {
        let entered = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let registry = Arc::new(ActionRegistry::new());
        let cb = {
            let entered = entered.clone();
            let release = release.clone();
            callback(move |_refs| {
                let entered = entered.clone();
                let release = release.clone();
                async move {
                    entered.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(())
                }
            })
        };
        registry
            .register(
                "blocker",
                HashMap::from([("hold".to_string(), AnytimeSpec::new("Hold", cb))]),
                vec![],
            )
            .expect("register");

        let table = table_for(&[
            (17, Gesture::Short, "blocker_hold"),
            (27, Gesture::Short, "blocker_hold"),
        ]);
        let harness = spawn_dispatcher(registry, table);

        trigger(&harness, 17, Gesture::Short).await;
        assert_eq!(entered.load(Ordering::SeqCst), 1);

        // Same line and a different line: both dropped while in flight.
        trigger(&harness, 17, Gesture::Short).await;
        trigger(&harness, 27, Gesture::Short).await;
        assert_eq!(entered.load(Ordering::SeqCst), 1);

        // Completion releases the permit and dispatch resumes.
        release.notify_one();
        sleep(Duration::from_millis(10)).await;
        trigger(&harness, 27, Gesture::Short).await;
        assert_eq!(entered.load(Ordering::SeqCst), 2);
        release.notify_one();
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_action_releases_the_lock_for_the_next_trigger() {
        let entered = Arc::new(AtomicUsize::new(0));

        let registry = Arc::new(ActionRegistry::new());
        let cb = {
            let entered = entered.clone();
            callback(move |_refs| {
                let entered = entered.clone();
                async move {
                    entered.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_secs(600)).await;
                    Ok(())
                }
            })
        };
        registry
            .register(
                "sleeper",
                HashMap::from([("nap".to_string(), AnytimeSpec::new("Nap", cb))]),
                vec![],
            )
            .expect("register");

        let table = table_for(&[(17, Gesture::Short, "sleeper_nap")]);
        let harness = spawn_dispatcher(registry, table);

        trigger(&harness, 17, Gesture::Short).await;
        assert_eq!(entered.load(Ordering::SeqCst), 1);

        // Still in flight: the permit is held and the trigger is dropped.
        trigger(&harness, 17, Gesture::Short).await;
        assert_eq!(entered.load(Ordering::SeqCst), 1);

        // Past the callback ceiling the ticket times out, the execution is
        // abandoned and dispatch admits the next trigger.
        sleep(builtin::CALLBACK_TIMEOUT + Duration::from_secs(1)).await;
        trigger(&harness, 17, Gesture::Short).await;
        assert_eq!(entered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_callback_marks_ticket_timed_out() {
        let refs = ActionRefs {
            device: DeviceHandle::default(),
            refresh: RefreshHandle::new(mpsc::channel(1).0),
            app: AppHandle::default(),
            current_display: None,
        };
        let action = ResolvedAction::Callback {
            id: "sleeper".to_string(),
            callback: callback(|_refs| async {
                sleep(Duration::from_secs(600)).await;
                Ok(())
            }),
            display: None,
        };
        let ticket = ExecutionTicket::new(1, action.describe(), action.timeout());
        let finished = execute_ticket(ticket, action, refs).await;
        assert_eq!(finished.status, TicketStatus::TimedOut);
        assert_eq!(finished.timeout, builtin::CALLBACK_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn display_binding_without_display_context_is_a_noop() {
        let entered = Arc::new(AtomicUsize::new(0));
        let seen_plugin = Arc::new(Mutex::new(None::<String>));

        let registry = Arc::new(ActionRegistry::new());
        let cb = {
            let entered = entered.clone();
            let seen_plugin = seen_plugin.clone();
            callback(move |refs| {
                let entered = entered.clone();
                let seen_plugin = seen_plugin.clone();
                async move {
                    entered.fetch_add(1, Ordering::SeqCst);
                    *seen_plugin.lock().expect("lock") =
                        refs.current_display.map(|d| d.plugin_id);
                    Ok(())
                }
            })
        };
        registry
            .register("weather", HashMap::new(), vec![cb])
            .expect("register");

        let table = table_for(&[(17, Gesture::Short, "display_action_0")]);
        let harness = spawn_dispatcher(registry, table);

        // Nothing displayed: trigger is ignored, no permit is consumed.
        trigger(&harness, 17, Gesture::Short).await;
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        // With a matching display the callback runs and sees its context.
        harness
            .display_tx
            .send(Some(DisplayContext {
                plugin_id: "weather".to_string(),
                instance: "office".to_string(),
            }))
            .expect("display receiver alive");
        trigger(&harness, 17, Gesture::Short).await;
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert_eq!(
            seen_plugin.lock().expect("lock").as_deref(),
            Some("weather")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_action_is_dropped_and_dispatch_continues() {
        let registry = Arc::new(ActionRegistry::new());
        let table = table_for(&[
            (17, Gesture::Short, "ghost_missing"),
            (17, Gesture::Long, "core_force_refresh"),
        ]);
        let mut harness = spawn_dispatcher(registry, table);

        trigger(&harness, 17, Gesture::Short).await;
        assert!(harness.refresh_rx.try_recv().is_err());

        trigger(&harness, 17, Gesture::Long).await;
        let request = timeout(Duration::from_secs(1), harness.refresh_rx.recv())
            .await
            .expect("request in time")
            .expect("channel open");
        assert_eq!(request, RefreshRequest::ForceCurrent);
    }

    #[tokio::test(start_paused = true)]
    async fn placeholder_binding_is_a_noop() {
        let registry = Arc::new(ActionRegistry::new());
        let table = table_for(&[
            (17, Gesture::Short, "none"),
            (17, Gesture::Double, ""),
        ]);
        let mut harness = spawn_dispatcher(registry, table);

        trigger(&harness, 17, Gesture::Short).await;
        trigger(&harness, 17, Gesture::Double).await;
        assert!(harness.refresh_rx.try_recv().is_err());
    }
}
