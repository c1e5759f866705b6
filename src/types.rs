use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::storage::Stats;

/// One captured camera frame.
pub type Frame = image::RgbImage;

/// A live camera feed, owned by the camera subsystem.
///
/// `capture_frame` is only ever called on the UI dispatcher.
pub trait FrameSource: Send + Sync {
    fn is_connected(&self) -> bool;
    fn capture_frame(&self) -> Option<Frame>;
}

/// Supplies arbitrary application status to embed in the push payload.
pub trait StatusProvider: Send + Sync {
    /// Must be a JSON document when `Some`.
    fn current_status_json(&self) -> Option<String>;
}

/// Host hooks used by the display-off path to wake the app and send it back.
pub trait DisplayController: Send + Sync {
    fn is_backgrounded(&self) -> bool;
    fn is_recording(&self) -> bool;
    /// e.g. a display-off recording mode that needs the app kept in front.
    fn must_stay_foreground(&self) -> bool;
    fn wake_to_foreground(&self);
    fn move_to_background(&self);
    fn has_connected_sources(&self) -> bool;
}

pub trait HeartbeatListener: Send + Sync {
    fn on_started(&self) {}
    fn on_stopped(&self) {}
    fn on_success(&self, _timestamp: i64) {}
    fn on_failed(&self, _message: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreenState {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Stopped,
    ForegroundActive,
    BackgroundArmed,
    BackgroundExecuting,
}

impl RunState {
    pub fn is_background(self) -> bool {
        matches!(self, RunState::BackgroundArmed | RunState::BackgroundExecuting)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub run_state: RunState,
    pub screen: ScreenState,
    pub executing: bool,
    pub stats: Stats,
}

impl StatusSnapshot {
    pub fn is_running(&self) -> bool {
        self.run_state != RunState::Stopped
    }

    pub fn is_screen_on_push_running(&self) -> bool {
        self.run_state == RunState::ForegroundActive
    }

    pub fn is_screen_off_push_running(&self) -> bool {
        self.run_state.is_background()
    }
}

/// JSON body of a heartbeat push.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload<'a> {
    pub vehicle_id: &'a str,
    pub timestamp: i64,
    pub nonce: &'a str,
    pub signature: &'a str,
    pub image_base64: String,
    pub image_width: u32,
    pub image_height: u32,
    pub image_size_bytes: usize,
    pub camera_count: usize,
    /// Embedded verbatim; serializes as `null` when absent.
    pub status: Option<&'a RawValue>,
}

/// Outcome of a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReceipt {
    pub status: u16,
    pub body: String,
}
