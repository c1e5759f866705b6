use image::{imageops, Rgb, RgbImage};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{HeartbeatError, HeartbeatResult};
use crate::types::{Frame, FrameSource};

/// Fill for the unused bottom-right slot of a three-camera grid.
pub const BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);

const MAX_TILES: usize = 4;

#[derive(Debug, Clone)]
pub struct CompositeImage {
    pub image: RgbImage,
    /// Number of frames that made it into the composite.
    pub source_count: usize,
}

impl CompositeImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Captures one frame per source. Disconnected or failing sources are
/// skipped, never retried.
pub fn capture_frames(sources: &[Arc<dyn FrameSource>]) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(sources.len());
    for (idx, source) in sources.iter().enumerate() {
        if !source.is_connected() {
            debug!(source = idx, "Skipping disconnected frame source");
            continue;
        }
        match source.capture_frame() {
            Some(frame) => frames.push(frame),
            None => warn!(source = idx, "Frame source returned no frame"),
        }
    }
    frames
}

/// Tiles captured frames: 1 copied as is, 2 side by side, 3 or 4 in a 2x2
/// grid (top-left, top-right, bottom-left, bottom-right). Frames past the
/// fourth are left out.
pub fn compose(frames: &[Frame]) -> HeartbeatResult<CompositeImage> {
    if frames.len() > MAX_TILES {
        debug!(dropped = frames.len() - MAX_TILES, "More frames than grid slots");
    }
    let frames = &frames[..frames.len().min(MAX_TILES)];
    let first = frames
        .first()
        .ok_or_else(|| HeartbeatError::Capture("no frames captured".to_string()))?;
    let (w, h) = first.dimensions();
    if w == 0 || h == 0 {
        return Err(HeartbeatError::Capture("empty frame".to_string()));
    }
    if let Some(odd) = frames.iter().find(|f| f.dimensions() != (w, h)) {
        return Err(HeartbeatError::Capture(format!(
            "frame size mismatch: {}x{} vs {}x{}",
            odd.width(),
            odd.height(),
            w,
            h
        )));
    }

    let image = match frames.len() {
        1 => first.clone(),
        2 => {
            let mut canvas = RgbImage::new(w * 2, h);
            imageops::replace(&mut canvas, &frames[0], 0, 0);
            imageops::replace(&mut canvas, &frames[1], w as i64, 0);
            canvas
        }
        _ => {
            let mut canvas = RgbImage::from_pixel(w * 2, h * 2, BACKGROUND);
            let slots = [(0, 0), (w as i64, 0), (0, h as i64), (w as i64, h as i64)];
            for (frame, (x, y)) in frames.iter().zip(slots) {
                imageops::replace(&mut canvas, frame, x, y);
            }
            canvas
        }
    };

    debug!(
        frames = frames.len(),
        width = image.width(),
        height = image.height(),
        "Composite built"
    );
    Ok(CompositeImage {
        image,
        source_count: frames.len(),
    })
}
