use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tracing::debug;

use crate::error::{HeartbeatError, HeartbeatResult};

pub const UNCOMPRESSED_QUALITY: u8 = 95;
pub const MIN_QUALITY: u8 = 10;
pub const MAX_QUALITY: u8 = 95;
pub const INITIAL_QUALITY: u8 = 70;
pub const MAX_ENCODES: u32 = 6;
const MIN_TOLERANCE_KB: i64 = 20;

#[derive(Debug, Clone)]
pub struct Compressed {
    pub bytes: Vec<u8>,
    pub quality: u8,
    pub encodes: u32,
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> HeartbeatResult<Vec<u8>> {
    if image.width() == 0 || image.height() == 0 {
        return Err(HeartbeatError::Compression("source image is empty".to_string()));
    }
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .encode_image(image)
        .map_err(|e| HeartbeatError::Compression(e.to_string()))?;
    if bytes.is_empty() {
        return Err(HeartbeatError::Compression("encoder produced no data".to_string()));
    }
    Ok(bytes)
}

/// JPEG-encodes `image` as close to `target_kb` as six encodes allow.
/// `target_kb <= 0` means a single encode at quality 95.
pub fn compress(image: &RgbImage, target_kb: i64) -> HeartbeatResult<Compressed> {
    search_quality(target_kb, |quality| encode_jpeg(image, quality))
}

pub(crate) fn search_quality<F>(target_kb: i64, mut encode: F) -> HeartbeatResult<Compressed>
where
    F: FnMut(u8) -> HeartbeatResult<Vec<u8>>,
{
    if target_kb <= 0 {
        let bytes = encode(UNCOMPRESSED_QUALITY)?;
        debug!(size_kb = bytes.len() / 1024, "Encoded without size target");
        return Ok(Compressed {
            bytes,
            quality: UNCOMPRESSED_QUALITY,
            encodes: 1,
        });
    }

    let target_bytes = target_kb * 1024;
    let tolerance = MIN_TOLERANCE_KB.max(target_kb / 5);
    let mut low = MIN_QUALITY as i64;
    let mut high = MAX_QUALITY as i64;
    let mut quality = INITIAL_QUALITY as i64;
    let mut best: Option<Compressed> = None;
    let mut encodes = 0;

    while low <= high && encodes < MAX_ENCODES {
        encodes += 1;
        let bytes = encode(quality as u8)?;
        let size = bytes.len() as i64;
        let size_kb = size / 1024;
        best = Some(Compressed {
            bytes,
            quality: quality as u8,
            encodes,
        });

        if (size_kb - target_kb).abs() <= tolerance {
            debug!(quality, size_kb, target_kb, encodes, "Compression converged");
            break;
        }
        if quality <= MIN_QUALITY as i64 {
            debug!(size_kb, target_kb, "Reached quality floor");
            break;
        }

        if size > target_bytes {
            high = quality - 1;
        } else {
            low = quality + 1;
        }
        quality = (MIN_QUALITY as i64).max((low + high) / 2);
    }

    best.ok_or_else(|| HeartbeatError::Compression("no encode attempted".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Fake encoder whose output grows linearly with quality.
    fn linear(kb_per_step: usize, calls: &mut Vec<u8>) -> impl FnMut(u8) -> HeartbeatResult<Vec<u8>> + '_ {
        move |q| {
            calls.push(q);
            Ok(vec![0u8; q as usize * kb_per_step * 1024])
        }
    }

    #[test]
    fn zero_target_encodes_once_at_fixed_quality() {
        let mut calls = Vec::new();
        let out = search_quality(0, linear(2, &mut calls)).unwrap();
        assert_eq!(out.encodes, 1);
        assert_eq!(out.quality, UNCOMPRESSED_QUALITY);
        assert_eq!(calls, vec![95]);
    }

    #[test]
    fn converges_within_tolerance() {
        let mut calls = Vec::new();
        let out = search_quality(100, linear(2, &mut calls)).unwrap();
        // 70 -> 140KB too big, 39 -> 78KB too small, 54 -> 108KB fits
        assert_eq!(calls, vec![70, 39, 54]);
        assert_eq!(out.quality, 54);
        assert!((out.bytes.len() as i64 / 1024 - 100).abs() <= 20);
    }

    #[test]
    fn stops_at_quality_floor_when_target_unreachable() {
        let mut calls = Vec::new();
        let out = search_quality(100, linear(40, &mut calls)).unwrap();
        assert!(out.encodes <= MAX_ENCODES);
        assert_eq!(out.quality, MIN_QUALITY);
        assert_eq!(*calls.last().unwrap(), MIN_QUALITY);
        assert!(!out.bytes.is_empty());
    }

    #[test]
    fn never_exceeds_encode_cap() {
        let mut calls = Vec::new();
        // always far too small: the search keeps raising quality
        let out = search_quality(1024, linear(1, &mut calls)).unwrap();
        assert!(calls.len() as u32 <= MAX_ENCODES);
        assert_eq!(out.encodes, calls.len() as u32);
    }

    #[test]
    fn real_jpeg_stays_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let image = RgbImage::from_fn(320, 240, |_, _| image::Rgb([rng.gen(), rng.gen(), rng.gen()]));
        let out = compress(&image, 100).unwrap();
        assert!(out.encodes <= MAX_ENCODES);
        assert_eq!(&out.bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn empty_image_is_rejected() {
        let err = compress(&RgbImage::new(0, 0), 100).unwrap_err();
        assert!(matches!(err, HeartbeatError::Compression(_)));
    }
}
