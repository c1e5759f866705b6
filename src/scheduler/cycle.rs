use chrono::Utc;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::notify::Notifier;
use crate::compose::{self, CompositeImage};
use crate::compress::{self, Compressed};
use crate::config::HeartbeatConfig;
use crate::dispatch::{DispatchError, UiDispatcher};
use crate::error::{HeartbeatError, HeartbeatResult};
use crate::net::{PushRequest, Submitter};
use crate::storage::SettingsStore;
use crate::types::{FrameSource, PushReceipt, StatusProvider};

pub type SourceList = Arc<RwLock<Vec<Arc<dyn FrameSource>>>>;

/// Everything a cycle worker needs, shared between cycles.
pub(crate) struct CycleContext {
    pub store: Arc<SettingsStore>,
    pub device_id: String,
    pub sources: SourceList,
    pub status: Option<Arc<dyn StatusProvider>>,
    pub submitter: Arc<dyn Submitter>,
    pub ui: UiDispatcher,
    pub notifier: Notifier,
    pub capture_timeout: Duration,
}

/// What one successful cycle produced.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: i64,
    pub width: u32,
    pub height: u32,
    pub source_count: usize,
    pub image_size: usize,
    pub quality: u8,
    pub receipt: PushReceipt,
}

fn checkpoint(cancel: &CancellationToken, stage: &'static str) -> HeartbeatResult<()> {
    if cancel.is_cancelled() {
        Err(HeartbeatError::Cancelled(stage))
    } else {
        Ok(())
    }
}

pub(crate) async fn run_cycle(
    ctx: &CycleContext,
    cancel: &CancellationToken,
) -> HeartbeatResult<CycleReport> {
    let started_at = Utc::now().timestamp_millis();
    let config = HeartbeatConfig::load(&ctx.store)?;
    if !config.is_configured() {
        return Err(HeartbeatError::Config(config.config_status().to_string()));
    }

    checkpoint(cancel, "capture")?;
    let sources: Vec<Arc<dyn FrameSource>> = ctx
        .sources
        .read()
        .map_err(|_| HeartbeatError::Unexpected("frame source list poisoned".to_string()))?
        .clone();
    if sources.is_empty() {
        return Err(HeartbeatError::Capture("no frame sources registered".to_string()));
    }
    let connected: Vec<_> = sources.into_iter().filter(|s| s.is_connected()).collect();
    if connected.is_empty() {
        return Err(HeartbeatError::Capture("no frame sources connected".to_string()));
    }
    debug!(connected = connected.len(), "Capturing frames on UI context");

    let frames = ctx
        .ui
        .call(move || compose::capture_frames(&connected), ctx.capture_timeout)
        .await
        .map_err(|e| match e {
            DispatchError::Timeout(_) => HeartbeatError::Capture("timed out waiting for frames".to_string()),
            DispatchError::Closed => HeartbeatError::Capture("ui context unavailable".to_string()),
        })?;

    checkpoint(cancel, "compression")?;
    let target_kb = config.target_size_kb;
    let (composite, compressed): (CompositeImage, Compressed) = tokio::task::spawn_blocking(move || {
        let composite = compose::compose(&frames)?;
        let compressed = compress::compress(&composite.image, target_kb)?;
        Ok::<_, HeartbeatError>((composite, compressed))
    })
    .await
    .map_err(|e| HeartbeatError::Unexpected(e.to_string()))??;

    checkpoint(cancel, "submission")?;
    let status_json = ctx.status.as_ref().and_then(|p| p.current_status_json());
    let image_size = compressed.bytes.len();
    let receipt = ctx
        .submitter
        .push(PushRequest {
            endpoint: config.endpoint,
            device_id: ctx.device_id.clone(),
            secret: config.secret,
            image_bytes: compressed.bytes,
            width: composite.width(),
            height: composite.height(),
            source_count: composite.source_count,
            status_json,
        })
        .await?;

    Ok(CycleReport {
        started_at,
        width: composite.width(),
        height: composite.height(),
        source_count: composite.source_count,
        image_size,
        quality: compressed.quality,
        receipt,
    })
}

/// Runs one cycle and records its result into the stats and the listener.
pub(crate) async fn execute(ctx: &CycleContext, cancel: &CancellationToken) {
    match run_cycle(ctx, cancel).await {
        Ok(report) => {
            let now = Utc::now().timestamp_millis();
            if let Err(e) = ctx.store.record_success(now) {
                error!(error = %e, "Failed to record heartbeat success");
            }
            info!(
                duration_ms = now - report.started_at,
                size_kb = report.image_size / 1024,
                quality = report.quality,
                width = report.width,
                height = report.height,
                sources = report.source_count,
                status = report.receipt.status,
                "Heartbeat pushed"
            );
            ctx.notifier.success(now);
        }
        Err(HeartbeatError::Cancelled(stage)) => {
            debug!(stage, "Heartbeat cycle cancelled");
        }
        Err(e) => record_failure(ctx, &e),
    }
}

pub(crate) fn record_failure(ctx: &CycleContext, err: &HeartbeatError) {
    let message = err.to_string();
    if let Err(e) = ctx.store.record_failure(&message) {
        error!(error = %e, "Failed to record heartbeat failure");
    }
    warn!(error = %message, http_status = ?err.http_status(), "Heartbeat failed");
    ctx.notifier.failed(message);
}
