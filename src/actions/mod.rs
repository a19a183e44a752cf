//! Action registry and dispatch: turns resolved gestures into executed
//! actions under a system-wide single-flight guarantee.
//!
//! The [`ActionRegistry`] is an explicit object owned by the composition
//! root and shared by reference; built-in Core/System actions live in
//! [`builtin`], collaborator (plugin) actions are registered at wiring time.
//! The [`dispatcher`] consumes gesture events, resolves bindings against a
//! consistent binding-table snapshot and executes at most one action at a
//! time with a per-class timeout.

pub mod builtin;
pub mod dispatcher;
pub mod registry;

pub use dispatcher::{Dispatcher, ExecutionTicket, TicketStatus};
pub use registry::{ActionRegistry, MAX_DISPLAY_ACTIONS};

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Future returned by an action callback.
pub type ActionFuture = Pin<Box<dyn Future<Output = color_eyre::Result<()>> + Send>>;

/// A collaborator-supplied action body. Callbacks receive the reference
/// bundle and run on the dispatcher's execution task, never on the edge or
/// timer path.
pub type ActionCallback = Arc<dyn Fn(ActionRefs) -> ActionFuture + Send + Sync>;

/// Wraps an async closure into an [`ActionCallback`].
pub fn callback<F, Fut>(f: F) -> ActionCallback
where
    F: Fn(ActionRefs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = color_eyre::Result<()>> + Send + 'static,
{
    Arc::new(move |refs| Box::pin(f(refs)))
}

/// Visibility scope of a registered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionScope {
    /// Invocable regardless of what is currently displayed.
    Anytime,
    /// Invocable only while the owning plugin's content is displayed.
    Display,
}

/// Errors from registration, resolution and execution. Every one of these
/// degrades a single trigger or registration; none are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("action not registered: {0}")]
    ActionNotFound(String),

    #[error("plugin {plugin} supplied {supplied} display actions, maximum is {max}")]
    TooManyDisplayActions {
        plugin: String,
        supplied: usize,
        max: usize,
    },

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("invalid action parameter: {0}")]
    InvalidParameter(String),

    #[error("action execution failed: {0}")]
    ExecutionFailed(String),

    #[error("action channel error: {0}")]
    ChannelError(String),
}

/// Host refresh operations a button can request. The playlist/refresh logic
/// itself belongs to the host application; the daemon only sends requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRequest {
    /// Advance to the next playlist item and refresh.
    Advance,
    /// Re-show the currently displayed item.
    ForceCurrent,
    /// Step back to the previous playlist item.
    Previous,
}

/// Handle for triggering host refreshes from action bodies.
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<RefreshRequest>,
}

impl RefreshHandle {
    pub fn new(tx: mpsc::Sender<RefreshRequest>) -> Self {
        Self { tx }
    }

    /// Non-blocking send; a full host queue fails the action rather than
    /// stalling the dispatcher.
    pub fn request(&self, request: RefreshRequest) -> Result<(), ActionError> {
        self.tx
            .try_send(request)
            .map_err(|e| ActionError::ChannelError(e.to_string()))
    }
}

/// Host appliance configuration handle passed to callbacks.
#[derive(Debug, Clone, Default)]
pub struct DeviceHandle {
    /// Location of the host configuration file.
    pub config_path: PathBuf,
}

/// Process-level handle: identity of the service unit controlled by the
/// system restart action.
#[derive(Debug, Clone)]
pub struct AppHandle {
    pub service_name: String,
}

impl Default for AppHandle {
    fn default() -> Self {
        Self {
            service_name: "gestured".to_string(),
        }
    }
}

/// Identity of the currently displayed plugin content, published by the
/// host. Display-scope actions only fire while their owning plugin matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayContext {
    pub plugin_id: String,
    pub instance: String,
}

/// Reference bundle handed to every action callback: named, typed fields
/// instead of an untyped map. `current_display` is populated for
/// display-scope actions only.
#[derive(Clone)]
pub struct ActionRefs {
    pub device: DeviceHandle,
    pub refresh: RefreshHandle,
    pub app: AppHandle,
    pub current_display: Option<DisplayContext>,
}

impl fmt::Debug for ActionRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRefs")
            .field("device", &self.device)
            .field("app", &self.app)
            .field("current_display", &self.current_display)
            .finish()
    }
}
