use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use heartbeat_agent::config::AgentConfig;
use heartbeat_agent::identity::{self, DeviceCharacteristics};
use heartbeat_agent::simulate::{self, HeadlessDisplay, SimulatedStatus};
use heartbeat_agent::{FrameSource, HeartbeatListener, SchedulerBuilder, SettingsStore};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

struct LogListener;

impl HeartbeatListener for LogListener {
    fn on_started(&self) {
        info!("Listener: heartbeat started");
    }

    fn on_stopped(&self) {
        info!("Listener: heartbeat stopped");
    }

    fn on_success(&self, timestamp: i64) {
        info!(timestamp, "Listener: heartbeat delivered");
    }

    fn on_failed(&self, message: &str) {
        warn!(error = message, "Listener: heartbeat failed");
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = AgentConfig::from_env()?;
    let snapshot_path = AgentConfig::file_path();
    if let Err(e) = config.save_to_file(&snapshot_path) {
        warn!(error = %e, path = %snapshot_path.display(), "Could not write agent config snapshot");
    }
    info!(
        db = %config.db_path.display(),
        cameras = config.simulated_cameras,
        endpoint = ?config.endpoint,
        "Heartbeat agent starting"
    );

    let store = Arc::new(
        SettingsStore::open(&config.db_path)
            .with_context(|| format!("opening settings at {}", config.db_path.display()))?,
    );
    config.apply_seeds(&store)?;

    let device_id = identity::ensure_device_id(&store, &DeviceCharacteristics::detect())?;
    info!(device_id = %device_id, "Device identity ready");

    let cameras = simulate::cameras(config.simulated_cameras, config.frame_width, config.frame_height);
    let sources: Vec<Arc<dyn FrameSource>> = cameras
        .iter()
        .map(|c| c.clone() as Arc<dyn FrameSource>)
        .collect();

    let handle = SchedulerBuilder::new(store.clone(), device_id)
        .sources(sources)
        .status_provider(Arc::new(SimulatedStatus::default()))
        .display_controller(Arc::new(HeadlessDisplay::new(cameras)))
        .spawn()?;
    handle.subscribe(Arc::new(LogListener));

    let hb = handle.config()?;
    info!(
        status = hb.config_status(),
        enabled = hb.enabled,
        interval = hb.interval.display_name(),
        target = %heartbeat_agent::config::target_size_display_name(hb.target_size_kb),
        "Heartbeat settings"
    );
    handle.on_config_changed()?;

    let mut status_interval = time::interval(STATUS_LOG_INTERVAL);
    loop {
        tokio::select! {
            _ = status_interval.tick() => {
                match handle.snapshot().await {
                    Ok(snapshot) => info!(
                        state = ?snapshot.run_state,
                        running = snapshot.is_running(),
                        display_off_mode = snapshot.is_screen_off_push_running(),
                        executing = snapshot.executing,
                        success = snapshot.stats.success_count,
                        failed = snapshot.stats.fail_count,
                        last_error = %snapshot.stats.last_error,
                        "Heartbeat status"
                    ),
                    Err(e) => error!(error = %e, "Failed to read heartbeat status"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                handle.shutdown()?;
                break;
            }
        }
    }
    Ok(())
}
