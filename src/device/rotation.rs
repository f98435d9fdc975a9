//! Orientation and zoom arithmetic.

use super::CameraInfo;
use crate::frame::{Facing, Rotation};

/// Rotation cached for one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CameraRotation {
    /// Stamped into every frame descriptor.
    pub frame: Rotation,
    /// Handed to the device for on-screen preview. Mirrored for front cameras.
    pub display_orientation: u32,
}

/// Combine the display rotation with the sensor orientation.
///
/// Front cameras add the display rotation and mirror the preview; back
/// cameras subtract it.
pub fn compute_rotation(display: Rotation, camera: &CameraInfo) -> CameraRotation {
    let degrees = display.degrees();
    let sensor = camera.orientation.degrees();
    let (angle, display_orientation) = match camera.facing {
        Facing::Front => {
            let angle = (sensor + degrees) % 360;
            (angle, (360 - angle) % 360)
        }
        Facing::Back => {
            let angle = (sensor + 360 - degrees) % 360;
            (angle, angle)
        }
    };
    CameraRotation {
        frame: Rotation::from_degrees(angle).unwrap_or_default(),
        display_orientation,
    }
}

/// Next zoom level for a pinch `scale`, clamped to `0..=max`.
///
/// Zooming in steps by a tenth of the range per unit of scale; zooming out
/// scales the current level.
pub fn compute_zoom(current: u32, max: u32, scale: f32) -> u32 {
    let current = current as f32 + 1.0;
    let next = if scale > 1.0 {
        current + scale * (max / 10) as f32
    } else {
        current * scale
    };
    let level = next.round() - 1.0;
    if level < 0.0 {
        0
    } else if level > max as f32 {
        max
    } else {
        level as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(facing: Facing, orientation: Rotation) -> CameraInfo {
        CameraInfo {
            id: "cam".to_string(),
            facing,
            orientation,
        }
    }

    #[test]
    fn back_camera_subtracts_display_rotation() {
        let r = compute_rotation(Rotation::Deg90, &camera(Facing::Back, Rotation::Deg90));
        assert_eq!(r.frame, Rotation::Deg0);
        assert_eq!(r.display_orientation, 0);

        let r = compute_rotation(Rotation::Deg0, &camera(Facing::Back, Rotation::Deg90));
        assert_eq!(r.frame, Rotation::Deg90);
        assert_eq!(r.display_orientation, 90);
    }

    #[test]
    fn front_camera_mirrors_display_orientation() {
        let r = compute_rotation(Rotation::Deg0, &camera(Facing::Front, Rotation::Deg270));
        assert_eq!(r.frame, Rotation::Deg270);
        assert_eq!(r.display_orientation, 90);

        let r = compute_rotation(Rotation::Deg90, &camera(Facing::Front, Rotation::Deg270));
        assert_eq!(r.frame, Rotation::Deg0);
        assert_eq!(r.display_orientation, 0);
    }

    #[test]
    fn zoom_in_steps_by_tenth_of_range() {
        // (0 + 1) + 2.0 * (30 / 10) = 7, minus one
        assert_eq!(compute_zoom(0, 30, 2.0), 6);
        assert_eq!(compute_zoom(28, 30, 3.0), 30);
    }

    #[test]
    fn zoom_out_scales_current_level() {
        // (9 + 1) * 0.5 = 5, minus one
        assert_eq!(compute_zoom(9, 30, 0.5), 4);
        assert_eq!(compute_zoom(0, 30, 0.1), 0);
    }
}
