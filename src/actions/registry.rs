//! Process-wide action registry for collaborator (plugin) actions.
//!
//! Plugins register during the host's component-wiring phase, potentially
//! after the dispatcher is already live, so mutation is serialized against
//! lookups by a short `RwLock` critical section; unrelated lookups proceed
//! concurrently. Two scopes exist: anytime actions (addressed by their
//! namespaced id) and up to [`MAX_DISPLAY_ACTIONS`] display actions per
//! plugin (ordered, addressed by position).
//!
//! Registration is all-or-nothing: a call supplying too many display
//! actions stores nothing, and re-registering a plugin id replaces that
//! plugin's prior entries in both scopes.

use crate::actions::{builtin, ActionCallback, ActionError, ActionScope};
use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Maximum display actions per plugin; keeps the settings dropdown of the
/// excluded configuration layer manageable.
pub const MAX_DISPLAY_ACTIONS: usize = 6;

/// Label and body of one anytime action, keyed by a plugin-local id at
/// registration.
#[derive(Clone)]
pub struct AnytimeSpec {
    pub label: String,
    pub callback: ActionCallback,
}

impl AnytimeSpec {
    pub fn new(label: impl Into<String>, callback: ActionCallback) -> Self {
        Self {
            label: label.into(),
            callback,
        }
    }
}

/// Resolved registry entry.
#[derive(Clone)]
pub struct ActionDescriptor {
    /// Namespaced id, `<plugin_id>_<local id>` for anytime actions.
    pub id: String,
    pub label: String,
    pub plugin_id: String,
    pub scope: ActionScope,
    pub callback: ActionCallback,
}

impl fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("plugin_id", &self.plugin_id)
            .field("scope", &self.scope)
            .finish()
    }
}

/// One entry of the discovery listing consumed by the settings layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionInfo {
    pub id: String,
    pub label: String,
    pub group: &'static str,
}

/// Registry statistics for debug logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub anytime_count: usize,
    pub plugins_with_display: usize,
    pub max_display: usize,
}

#[derive(Default)]
struct RegistryInner {
    anytime: HashMap<String, ActionDescriptor>,
    display: HashMap<String, Vec<ActionCallback>>,
}

/// Process-wide table mapping action identifiers to callable descriptors.
/// Owned by the composition root and shared via `Arc`; lifetime equals the
/// process lifetime.
#[derive(Default)]
pub struct ActionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        // A poisoned lock only means a panicked reader/writer; the table
        // itself stays usable.
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a plugin's actions. Anytime actions are namespaced as
    /// `<plugin_id>_<local id>`; display actions are stored in supplied
    /// order. More than [`MAX_DISPLAY_ACTIONS`] display actions rejects the
    /// whole call with nothing stored; other plugins are unaffected.
    /// Re-registration under the same plugin id replaces prior entries.
    pub fn register(
        &self,
        plugin_id: &str,
        anytime: HashMap<String, AnytimeSpec>,
        display: Vec<ActionCallback>,
    ) -> Result<(), ActionError> {
        if plugin_id.is_empty() {
            return Err(ActionError::InvalidRegistration(
                "plugin_id must be a non-empty string".to_string(),
            ));
        }
        if display.len() > MAX_DISPLAY_ACTIONS {
            return Err(ActionError::TooManyDisplayActions {
                plugin: plugin_id.to_string(),
                supplied: display.len(),
                max: MAX_DISPLAY_ACTIONS,
            });
        }

        let mut inner = self.write();

        // Replace any prior registration for this plugin, both scopes.
        inner.anytime.retain(|_, d| d.plugin_id != plugin_id);
        inner.display.remove(plugin_id);

        let anytime_count = anytime.len();
        for (local_id, spec) in anytime {
            let id = format!("{}_{}", plugin_id, local_id);
            info!("registered anytime action {} ({})", id, spec.label);
            inner.anytime.insert(
                id.clone(),
                ActionDescriptor {
                    id,
                    label: spec.label,
                    plugin_id: plugin_id.to_string(),
                    scope: ActionScope::Anytime,
                    callback: spec.callback,
                },
            );
        }
        if !display.is_empty() {
            let display_count = display.len();
            info!(
                "registered {} display action(s) for plugin {}",
                display_count, plugin_id
            );
            inner.display.insert(plugin_id.to_string(), display);
        }
        debug!(
            "plugin {} registration complete: {} anytime action(s)",
            plugin_id, anytime_count
        );
        Ok(())
    }

    /// Resolves an anytime action by its namespaced id.
    pub fn resolve(&self, action_id: &str) -> Result<ActionDescriptor, ActionError> {
        self.read()
            .anytime
            .get(action_id)
            .cloned()
            .ok_or_else(|| ActionError::ActionNotFound(action_id.to_string()))
    }

    /// Resolves the display action at `index` for the named plugin.
    pub fn resolve_display(
        &self,
        plugin_id: &str,
        index: usize,
    ) -> Result<ActionCallback, ActionError> {
        self.read()
            .display
            .get(plugin_id)
            .and_then(|actions| actions.get(index))
            .cloned()
            .ok_or_else(|| {
                ActionError::ActionNotFound(format!("display_action_{} of {}", index, plugin_id))
            })
    }

    /// Highest display action count registered by any plugin; determines
    /// how many generic `display_action_N` entries discovery offers.
    pub fn max_display_action_count(&self) -> usize {
        self.read()
            .display
            .values()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
    }

    /// Builds the action listing for the settings layer's dropdowns:
    /// built-in Core/System actions, registered anytime actions sorted by
    /// label, then generic display entries.
    pub fn available_actions(&self) -> Vec<ActionInfo> {
        let mut out: Vec<ActionInfo> = builtin::BUILTIN_ACTIONS
            .iter()
            .map(|b| ActionInfo {
                id: b.id.to_string(),
                label: b.label.to_string(),
                group: b.group,
            })
            .collect();

        let inner = self.read();
        let mut plugin_actions: Vec<ActionInfo> = inner
            .anytime
            .values()
            .map(|d| ActionInfo {
                id: d.id.clone(),
                label: d.label.clone(),
                group: "Other Plugins",
            })
            .collect();
        plugin_actions.sort_by(|a, b| a.label.to_lowercase().cmp(&b.label.to_lowercase()));
        out.extend(plugin_actions);

        let max_display = inner.display.values().map(Vec::len).max().unwrap_or(0);
        for index in 0..max_display {
            out.push(ActionInfo {
                id: format!("display_action_{}", index),
                label: format!("Display Action {}", index + 1),
                group: "Current Plugin",
            });
        }
        out
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.read();
        RegistryStats {
            anytime_count: inner.anytime.len(),
            plugins_with_display: inner.display.len(),
            max_display: inner.display.values().map(Vec::len).max().unwrap_or(0),
        }
    }
}
