// Module declarations for the application's core components
pub mod channels;       // Inter-component communication channels
pub mod config;         // Configuration management
pub mod derived;        // Values derived for unmapped roles
pub mod engine;         // Refresh engine
pub mod error;          // Error handling and types
pub mod health;         // Serving/failed state machine
pub mod mapping;        // Role -> source mappings
pub mod meter;          // Read-only meter view
pub mod mqtt;           // MQTT client and messaging
pub mod options;        // Command line options parsing
pub mod prelude;        // Common imports and types
pub mod register_image; // Published register snapshots
pub mod register_map;   // Register definitions and encoding
pub mod source;         // Measurement sources

// Get the package version from Cargo.toml
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;
use crate::mqtt::Mqtt;
use std::sync::Arc;
use std::time::Duration;

/// Manages all application components and their lifecycle
#[derive(Clone)]
pub struct Components {
    pub engine: RefreshEngine,
    pub mqtt: Mqtt,
    pub channels: Channels,
}

impl Components {
    /// Builds every component from the configuration. Fails only on a
    /// malformed register table.
    pub fn new(config: ConfigWrapper, channels: Channels) -> Result<Self> {
        let map = Arc::new(RegisterMap::dtsu666()?);
        info!(
            "register map: {} registers in {} blocks",
            map.len(),
            map.blocks().len()
        );

        let store = ValueStore::new(config.sources().max_age());
        let settings = EngineSettings::from_meter(&config.meter());
        let engine = RefreshEngine::new(
            map,
            Arc::new(store.clone()),
            Arc::new(config.clone()),
            settings,
        );
        let mqtt = Mqtt::new(config, channels.clone(), store, engine.handle());

        Ok(Self {
            engine,
            mqtt,
            channels,
        })
    }

    /// Gracefully stops all components in the correct order
    ///
    /// MQTT goes first so nothing reports on a meter that is shutting down,
    /// then the refresh engine.
    pub async fn stop(&self) {
        info!("Stopping all components...");

        self.mqtt.stop();
        self.engine.stop().await;

        info!("Shutdown complete");
    }
}

/// Main application entry point
///
/// This function initializes and starts all components of the application
/// in the correct order to ensure proper dependencies are available.
pub async fn app(
    mut shutdown_rx: broadcast::Receiver<()>,
    config: ConfigWrapper,
) -> Result<()> {
    info!("dtsu666-emulator {} starting", CARGO_PKG_VERSION);

    info!("Initializing channels...");
    let channels = Channels::new();

    info!("Initializing components...");
    let components = Components::new(config.clone(), channels.clone())?;

    let engine = components.engine.clone();
    engine
        .start(engine.settings().interval)
        .await
        .map_err(|e| anyhow!("failed to start refresh engine: {}", e))?;

    info!("  Creating MQTT client...");
    let mqtt = components.mqtt.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt.start().await {
            error!("MQTT task failed: {}", e);
        }
    });

    let reload_handle = tokio::spawn(reload_on_hangup(config, components.mqtt.clone()));

    info!("Waiting for shutdown signal...");
    let _ = shutdown_rx.recv().await;

    info!("Shutdown signal received, stopping components...");
    reload_handle.abort();
    components.stop().await;

    if let Err(e) = mqtt_handle.await {
        error!("Error waiting for MQTT task: {}", e);
    }

    info!("Application shutdown complete");
    Ok(())
}

/// Re-reads role mappings from the config file on SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(config: ConfigWrapper, mqtt: Mqtt) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!("Failed to listen for SIGHUP: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("SIGHUP received, reloading mappings");
        match config.reload() {
            Ok(()) => mqtt.resubscribe(),
            Err(e) => error!("config reload failed, keeping current mappings: {}", e),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_config: ConfigWrapper, _mqtt: Mqtt) {}

/// Initialises env_logger. Unless RUST_LOG is set, logging starts at info and
/// follows `set_log_level` afterwards.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("trace");
    let result = env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    match result {
        Ok(()) => set_log_level("info"),
        Err(e) => error!("Failed to initialise logging: {}", e),
    }
}

/// Applies the configured log level; RUST_LOG takes precedence.
pub fn set_log_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }

    match level.parse::<log::LevelFilter>() {
        Ok(filter) => log::set_max_level(filter),
        Err(_) => warn!("ignoring invalid loglevel {:?}", level),
    }
}

/// Application entry point
///
/// Installs the Ctrl+C handler (and the optional runtime limit) and runs the
/// application until either fires.
pub async fn run(config: ConfigWrapper, runtime: Option<Duration>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Set up signal handlers for graceful shutdown
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c: {}", e);
        }
        let _ = shutdown_tx_clone.send(());
    });

    if let Some(runtime) = runtime {
        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(runtime).await;
            info!("runtime limit of {}s reached", runtime.as_secs());
            let _ = shutdown_tx_clone.send(());
        });
    }

    app(shutdown_rx, config).await
}
