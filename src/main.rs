use color_eyre::Result;
use gestured::actions::{
    ActionRefs, ActionRegistry, AppHandle, DeviceHandle, Dispatcher, RefreshHandle,
};
use gestured::buttons::ButtonManagerHandle;
use gestured::config::ButtonsConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(ButtonsConfig::default_path);
    let config = match ButtonsConfig::load(&config_path) {
        Ok(config) => {
            info!(
                "loaded {} with {} button(s)",
                config_path.display(),
                config.buttons.len()
            );
            config
        }
        Err(e) => {
            warn!(
                "could not load {}: {} - starting with no buttons configured",
                config_path.display(),
                e
            );
            ButtonsConfig::default()
        }
    };

    let registry = Arc::new(ActionRegistry::new());
    debug!(
        "action registry ready, {} action(s) available",
        registry.available_actions().len()
    );

    let (gesture_tx, gesture_rx) = mpsc::channel(100);
    let (refresh_tx, mut refresh_rx) = mpsc::channel(16);
    // The host publishes the currently displayed plugin here; standalone
    // there is none and display-scope bindings stay inert.
    let (_display_tx, display_rx) = watch::channel(None);

    let manager = ButtonManagerHandle::spawn(config, gesture_tx).await?;

    let service_name =
        std::env::var("APPNAME").unwrap_or_else(|_| "gestured".to_string());
    let refs = ActionRefs {
        device: DeviceHandle {
            config_path: config_path.clone(),
        },
        refresh: RefreshHandle::new(refresh_tx),
        app: AppHandle { service_name },
        current_display: None,
    };

    let dispatcher = Dispatcher::new(
        gesture_rx,
        manager.bindings(),
        display_rx,
        registry.clone(),
        refs,
    );
    tokio::spawn(dispatcher.run());

    // Standalone the refresh requests have no host to go to; log them so an
    // operator can see the pipeline working end to end.
    tokio::spawn(async move {
        while let Some(request) = refresh_rx.recv().await {
            info!("refresh requested: {:?}", request);
        }
    });

    run_until_shutdown(manager, config_path).await
}

/// Waits for SIGINT/SIGTERM, reloading the configuration on SIGHUP. A
/// reload that fails to load or validate is logged and the running
/// generation stays live.
async fn run_until_shutdown(manager: ButtonManagerHandle, config_path: PathBuf) -> Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP: reloading {}", config_path.display());
                match ButtonsConfig::load(&config_path) {
                    Ok(config) => {
                        if let Err(e) = manager.reload(config).await {
                            error!("reload failed: {} - previous configuration stays live", e);
                        }
                    }
                    Err(e) => {
                        error!("reload failed: {} - previous configuration stays live", e);
                    }
                }
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("interrupt received, shutting down");
                break;
            }
        }
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
