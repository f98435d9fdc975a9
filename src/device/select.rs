//! Preview size and frame rate selection.
//!
//! Closest-match policy: a preview size qualifies if some picture size shares
//! its aspect ratio; among those the one nearest the request (sum of absolute
//! width and height deltas) wins. Fps ranges are scored the same way against
//! both bounds, so the request does not have to fall inside the range.

use anyhow::{anyhow, Result};

use super::DeviceCapabilities;
use crate::frame::Size;

const ASPECT_RATIO_TOLERANCE: f32 = 0.01;

/// Frame rate range in frames per 1000 seconds, as camera HALs report them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FpsRange {
    pub min: u32,
    pub max: u32,
}

impl FpsRange {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// A fixed rate, e.g. `fixed(30.0)` is 30000..30000.
    pub fn fixed(fps: f32) -> Self {
        let scaled = scale_fps(fps) as u32;
        Self::new(scaled, scaled)
    }

    pub fn max_fps(&self) -> f32 {
        self.max as f32 / 1000.0
    }
}

/// A preview size and the picture size chosen alongside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizePair {
    pub preview: Size,
    pub picture: Option<Size>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Negotiated {
    pub sizes: SizePair,
    pub fps_range: FpsRange,
}

fn scale_fps(fps: f32) -> i64 {
    (f64::from(fps) * 1000.0).round() as i64
}

fn distance(size: Size, desired: Size) -> u64 {
    u64::from(size.width.abs_diff(desired.width)) + u64::from(size.height.abs_diff(desired.height))
}

/// Preview sizes that have a same-aspect picture size.
///
/// If none do, every preview size is accepted without a picture size.
pub fn valid_size_pairs(previews: &[Size], pictures: &[Size]) -> Vec<SizePair> {
    let mut pairs: Vec<SizePair> = previews
        .iter()
        .filter(|p| p.width > 0 && p.height > 0)
        .filter_map(|&preview| {
            let ratio = preview.aspect_ratio();
            pictures
                .iter()
                .filter(|p| p.width > 0 && p.height > 0)
                .find(|picture| (ratio - picture.aspect_ratio()).abs() < ASPECT_RATIO_TOLERANCE)
                .map(|&picture| SizePair {
                    preview,
                    picture: Some(picture),
                })
        })
        .collect();

    if pairs.is_empty() {
        log::warn!("no preview sizes have a corresponding same-aspect-ratio picture size");
        pairs = previews
            .iter()
            .map(|&preview| SizePair {
                preview,
                picture: None,
            })
            .collect();
    }
    pairs
}

/// Valid pair whose preview size is closest to `desired`. Earlier entries win ties.
pub fn select_size_pair(previews: &[Size], pictures: &[Size], desired: Size) -> Option<SizePair> {
    let mut best: Option<(u64, SizePair)> = None;
    for pair in valid_size_pairs(previews, pictures) {
        let diff = distance(pair.preview, desired);
        if best.map_or(true, |(min, _)| diff < min) {
            best = Some((diff, pair));
        }
    }
    best.map(|(_, pair)| pair)
}

/// Range minimising |desired - min| + |desired - max|, with fps scaled by 1000.
pub fn select_fps_range(ranges: &[FpsRange], desired_fps: f32) -> Option<FpsRange> {
    let desired = scale_fps(desired_fps);
    let mut best: Option<(i64, FpsRange)> = None;
    for &range in ranges {
        let diff = (desired - i64::from(range.min)).abs() + (desired - i64::from(range.max)).abs();
        if best.map_or(true, |(min, _)| diff < min) {
            best = Some((diff, range));
        }
    }
    best.map(|(_, range)| range)
}

pub fn negotiate(caps: &DeviceCapabilities, desired: Size, desired_fps: f32) -> Result<Negotiated> {
    let sizes = select_size_pair(&caps.preview_sizes, &caps.picture_sizes, desired)
        .ok_or_else(|| anyhow!("could not find suitable preview size"))?;
    let fps_range = select_fps_range(&caps.fps_ranges, desired_fps)
        .ok_or_else(|| anyhow!("could not find suitable preview frames per second range"))?;
    Ok(Negotiated { sizes, fps_range })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_nearest_preview_among_aspect_matched_pairs() {
        let previews = [Size::new(640, 480), Size::new(1280, 720)];
        let pictures = [Size::new(640, 480), Size::new(1920, 1080)];

        let pair = select_size_pair(&previews, &pictures, Size::new(1024, 768)).unwrap();
        assert_eq!(pair.preview, Size::new(1280, 720));
        assert_eq!(pair.picture, Some(Size::new(1920, 1080)));
    }

    #[test]
    fn previews_without_matching_picture_are_skipped() {
        let previews = [Size::new(1024, 768), Size::new(1280, 720)];
        let pictures = [Size::new(1920, 1080)];

        let pair = select_size_pair(&previews, &pictures, Size::new(1024, 768)).unwrap();
        assert_eq!(pair.preview, Size::new(1280, 720));
    }

    #[test]
    fn falls_back_to_every_preview_when_no_aspect_matches() {
        let previews = [Size::new(352, 288), Size::new(1024, 768)];
        let pictures = [Size::new(1920, 1080)];

        let pairs = valid_size_pairs(&previews, &pictures);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.picture.is_none()));

        let pair = select_size_pair(&previews, &pictures, Size::new(1000, 700)).unwrap();
        assert_eq!(pair.preview, Size::new(1024, 768));
    }

    #[test]
    fn nearest_fps_range_need_not_contain_request() {
        let ranges = [FpsRange::new(15000, 15000), FpsRange::new(30000, 30000)];
        assert_eq!(
            select_fps_range(&ranges, 29.97),
            Some(FpsRange::new(30000, 30000))
        );
    }

    #[test]
    fn fps_scoring_uses_both_bounds() {
        // 24 fps: (7000..30000) scores 17000 + 6000, (24000..24000) scores 0.
        let ranges = [FpsRange::new(7000, 30000), FpsRange::new(24000, 24000)];
        assert_eq!(
            select_fps_range(&ranges, 24.0),
            Some(FpsRange::new(24000, 24000))
        );
    }

    #[test]
    fn negotiate_fails_without_sizes_or_ranges() {
        let caps = DeviceCapabilities {
            preview_sizes: vec![Size::new(640, 480)],
            ..DeviceCapabilities::default()
        };
        let err = negotiate(&caps, Size::new(640, 480), 30.0).unwrap_err();
        assert!(err.to_string().contains("frames per second"));

        let empty = DeviceCapabilities::default();
        assert!(negotiate(&empty, Size::new(640, 480), 30.0).is_err());
    }
}
