//! Periodic signed camera heartbeat for vehicle head units.
//!
//! Captures every connected camera, tiles the frames into one JPEG near a
//! size target, and pushes it with an HMAC signature to a remote endpoint.
//! [`scheduler`] decides when that happens as the display goes on and off.

pub mod compose;
pub mod compress;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod net;
pub mod scheduler;
pub mod simulate;
pub mod storage;
pub mod timer;
pub mod types;

pub use config::{HeartbeatConfig, PushInterval};
pub use error::{HeartbeatError, HeartbeatResult};
pub use scheduler::{HeartbeatHandle, SchedulerBuilder, Timings};
pub use storage::{SettingsStore, Stats};
pub use types::{
    DisplayController, FrameSource, HeartbeatListener, RunState, ScreenState, StatusProvider,
    StatusSnapshot,
};
