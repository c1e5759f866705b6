use image::{Rgb, RgbImage};
use rand::Rng;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::types::{DisplayController, Frame, FrameSource, StatusProvider};

/// Synthetic camera producing a moving test pattern with sensor-like noise.
pub struct SimulatedCamera {
    index: u32,
    width: u32,
    height: u32,
    connected: AtomicBool,
    sequence: AtomicU32,
}

impl SimulatedCamera {
    pub fn new(index: u32, width: u32, height: u32) -> Self {
        Self {
            index,
            width,
            height,
            connected: AtomicBool::new(true),
            sequence: AtomicU32::new(0),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl FrameSource for SimulatedCamera {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn capture_frame(&self) -> Option<Frame> {
        if !self.is_connected() || self.width == 0 || self.height == 0 {
            return None;
        }
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let tint = (self.index * 60 % 256) as u8;
        let (w, h) = (self.width, self.height);
        let bar = (seq * 16) % w;
        let mut rng = rand::thread_rng();

        let frame = RgbImage::from_fn(w, h, |x, y| {
            if x >= bar && x < bar + 8 {
                return Rgb([255, 255, 255]);
            }
            let noise: u8 = rng.gen_range(0..24);
            Rgb([
                ((x * 255 / w) as u8 ^ tint).saturating_add(noise),
                ((y * 255 / h) as u8).saturating_add(noise),
                tint.wrapping_add(noise),
            ])
        });
        Some(frame)
    }
}

pub fn cameras(count: u64, width: u32, height: u32) -> Vec<Arc<SimulatedCamera>> {
    (0..count as u32)
        .map(|i| Arc::new(SimulatedCamera::new(i, width, height)))
        .collect()
}

/// Vehicle telemetry stand-in embedded in every push.
pub struct SimulatedStatus {
    booted: Instant,
    sequence: AtomicU32,
}

impl Default for SimulatedStatus {
    fn default() -> Self {
        Self {
            booted: Instant::now(),
            sequence: AtomicU32::new(0),
        }
    }
}

impl StatusProvider for SimulatedStatus {
    fn current_status_json(&self) -> Option<String> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut rng = rand::thread_rng();
        let status = json!({
            "sequence": sequence,
            "uptimeSecs": self.booted.elapsed().as_secs(),
            "batteryVoltage": 12.0 + rng.gen::<f32>() * 1.5,
            "speedKmh": rng.gen_range(0..90),
            "recording": false,
        });
        Some(status.to_string())
    }
}

/// Display hooks for a host with no window manager: always in the
/// foreground, never recording.
pub struct HeadlessDisplay {
    cameras: Vec<Arc<SimulatedCamera>>,
}

impl HeadlessDisplay {
    pub fn new(cameras: Vec<Arc<SimulatedCamera>>) -> Self {
        Self { cameras }
    }
}

impl DisplayController for HeadlessDisplay {
    fn is_backgrounded(&self) -> bool {
        false
    }

    fn is_recording(&self) -> bool {
        false
    }

    fn must_stay_foreground(&self) -> bool {
        false
    }

    fn wake_to_foreground(&self) {
        log::debug!("Headless display: wake requested");
    }

    fn move_to_background(&self) {
        log::debug!("Headless display: background requested");
    }

    fn has_connected_sources(&self) -> bool {
        self.cameras.iter().any(|c| c.is_connected())
    }
}
