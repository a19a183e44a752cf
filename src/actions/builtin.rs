//! Built-in Core/System action bodies.
//!
//! Core actions translate into [`RefreshRequest`]s for the host; system
//! actions and the two external actions (`external_script`, `call_url`)
//! shell out via `tokio::process`. All subprocesses are spawned with
//! `kill_on_drop`, so the dispatcher's timeout terminates them when it
//! abandons the execution future.

use crate::actions::{ActionError, AppHandle, RefreshRequest};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Timeout class for external script execution.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout class for network calls.
pub const URL_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout class for system commands (shutdown, reboot, service restart).
pub const SYSTEM_TIMEOUT: Duration = Duration::from_secs(10);
/// Overall safety ceiling for in-process collaborator callbacks.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(120);

/// Static descriptor of one built-in action for discovery listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinAction {
    pub id: &'static str,
    pub label: &'static str,
    pub group: &'static str,
}

/// Built-in Core/System actions, in the order discovery presents them.
pub const BUILTIN_ACTIONS: &[BuiltinAction] = &[
    BuiltinAction {
        id: "core_trigger_refresh",
        label: "Trigger refresh (next in playlist)",
        group: "Core",
    },
    BuiltinAction {
        id: "core_force_refresh",
        label: "Force refresh (re-show current)",
        group: "Core",
    },
    BuiltinAction {
        id: "core_next_playlist",
        label: "Next playlist item",
        group: "Core",
    },
    BuiltinAction {
        id: "core_prev_playlist",
        label: "Previous playlist item",
        group: "Core",
    },
    BuiltinAction {
        id: "system_shutdown",
        label: "Shutdown",
        group: "System",
    },
    BuiltinAction {
        id: "system_reboot",
        label: "Reboot",
        group: "System",
    },
    BuiltinAction {
        id: "system_restart_service",
        label: "Restart host service",
        group: "System",
    },
    BuiltinAction {
        id: "external_script",
        label: "Run external bash script",
        group: "System",
    },
    BuiltinAction {
        id: "call_url",
        label: "Call URL",
        group: "System",
    },
];

pub fn is_builtin(action_id: &str) -> bool {
    BUILTIN_ACTIONS.iter().any(|b| b.id == action_id)
}

/// Maps a core action id onto the host refresh request it stands for.
pub fn refresh_request_for(action_id: &str) -> Option<RefreshRequest> {
    match action_id {
        // Trigger and next are the same operation from the host's view.
        "core_trigger_refresh" | "core_next_playlist" => Some(RefreshRequest::Advance),
        "core_force_refresh" => Some(RefreshRequest::ForceCurrent),
        "core_prev_playlist" => Some(RefreshRequest::Previous),
        _ => None,
    }
}

/// System commands a button can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemAction {
    Shutdown,
    Reboot,
    RestartService,
}

impl SystemAction {
    pub fn from_action_id(action_id: &str) -> Option<Self> {
        match action_id {
            "system_shutdown" => Some(Self::Shutdown),
            "system_reboot" => Some(Self::Reboot),
            "system_restart_service" => Some(Self::RestartService),
            _ => None,
        }
    }
}

/// Runs an external bash script. The path must be absolute (after `~`
/// expansion) and confined to the service account's home directory, which
/// keeps execution predictable and rules out arbitrary system paths.
pub async fn run_external_script(parameter: Option<&str>) -> Result<(), ActionError> {
    let raw = parameter.unwrap_or("").trim();
    if raw.is_empty() {
        return Err(ActionError::InvalidParameter(
            "external_script: no script path configured".to_string(),
        ));
    }

    let script = validate_script_path(raw).await?;
    let workdir = script
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    debug!("external_script: executing bash {}", script.display());
    let output = Command::new("bash")
        .arg(&script)
        .current_dir(workdir)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ActionError::ExecutionFailed(format!("failed to run bash: {}", e)))?;

    log_captured_output("external_script", &output.stdout, &output.stderr);
    if output.status.success() {
        Ok(())
    } else {
        Err(ActionError::ExecutionFailed(format!(
            "external_script: {} exited with {}",
            script.display(),
            output.status
        )))
    }
}

async fn validate_script_path(raw: &str) -> Result<PathBuf, ActionError> {
    let home = dirs::home_dir().ok_or_else(|| {
        ActionError::ExecutionFailed("external_script: no home directory".to_string())
    })?;

    let expanded = if let Some(rest) = raw.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(raw)
    };
    if !expanded.is_absolute() {
        return Err(ActionError::InvalidParameter(format!(
            "external_script: path must be absolute: {}",
            raw
        )));
    }

    let script = tokio::fs::canonicalize(&expanded).await.map_err(|e| {
        ActionError::InvalidParameter(format!(
            "external_script: {}: {}",
            expanded.display(),
            e
        ))
    })?;
    let home = tokio::fs::canonicalize(&home).await.unwrap_or(home);
    if !script.starts_with(&home) {
        return Err(ActionError::InvalidParameter(format!(
            "external_script: path must be under {}: {}",
            home.display(),
            script.display()
        )));
    }
    let meta = tokio::fs::metadata(&script).await.map_err(|e| {
        ActionError::InvalidParameter(format!("external_script: {}: {}", script.display(), e))
    })?;
    if !meta.is_file() {
        return Err(ActionError::InvalidParameter(format!(
            "external_script: not a file: {}",
            script.display()
        )));
    }
    Ok(script)
}

/// Calls a URL via curl. Only `http://` and `https://` schemes are allowed.
pub async fn call_url(parameter: Option<&str>) -> Result<(), ActionError> {
    let url = parameter.unwrap_or("").trim();
    if url.is_empty() {
        return Err(ActionError::InvalidParameter(
            "call_url: no url configured".to_string(),
        ));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ActionError::InvalidParameter(format!(
            "call_url: url must start with http:// or https://: {}",
            url
        )));
    }

    info!("call_url: calling {}", url);
    let output = Command::new("curl")
        .args(["-s", "-f", "-L", "--max-time", "10", url])
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ActionError::ExecutionFailed(format!("call_url: curl unavailable: {}", e)))?;

    if output.status.success() {
        debug!("call_url: {} succeeded", url);
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ActionError::ExecutionFailed(format!(
            "call_url: curl exited with {} for {}: {}",
            output.status,
            url,
            stderr.chars().take(200).collect::<String>()
        )))
    }
}

/// Issues the system command for `action`. Runs without any request
/// context, same command family as the host's own shutdown route.
pub async fn run_system_command(action: SystemAction, app: &AppHandle) -> Result<(), ActionError> {
    let service_unit = format!("{}.service", app.service_name);
    let command: Vec<&str> = match action {
        SystemAction::Shutdown => vec!["sudo", "shutdown", "-h", "now"],
        SystemAction::Reboot => vec!["sudo", "reboot"],
        SystemAction::RestartService => vec!["sudo", "systemctl", "restart", &service_unit],
    };

    info!("system action {:?}: {}", action, command.join(" "));
    let status = Command::new(command[0])
        .args(&command[1..])
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| ActionError::ExecutionFailed(format!("{:?}: {}", action, e)))?;

    if status.success() {
        Ok(())
    } else {
        Err(ActionError::ExecutionFailed(format!(
            "{:?} exited with {}",
            action, status
        )))
    }
}

fn log_captured_output(context: &str, stdout: &[u8], stderr: &[u8]) {
    if !stdout.is_empty() {
        info!("{} stdout: {}", context, String::from_utf8_lossy(stdout).trim_end());
    }
    if !stderr.is_empty() {
        warn!("{} stderr: {}", context, String::from_utf8_lossy(stderr).trim_end());
    }
}
