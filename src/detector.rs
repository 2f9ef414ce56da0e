//! The fiducial detector is an external capability: given a frame it hands
//! back marker outlines and their ids. This module defines that seam and the
//! geometry the control loop needs to decide which marker the wearer is
//! looking at.

use crate::frame_channel::VideoFrame;
use serde::{Deserialize, Serialize};

pub type MarkerId = i32;

/// A detected marker: its id and its outline in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Marker {
    pub id: MarkerId,
    pub corners: Vec<(f32, f32)>,
}

impl Marker {
    /// True when `(x, y)` lies strictly inside the outline. Points on an
    /// edge or vertex do not count.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let n = self.corners.len();
        if n < 3 {
            return false;
        }

        let mut inside = false;
        for i in 0..n {
            let (x1, y1) = self.corners[i];
            let (x2, y2) = self.corners[(i + 1) % n];

            if on_segment((x1, y1), (x2, y2), (x, y)) {
                return false;
            }

            if (y1 > y) != (y2 > y) {
                let cross_x = x1 + (y - y1) * (x2 - x1) / (y2 - y1);
                if x < cross_x {
                    inside = !inside;
                }
            }
        }
        inside
    }
}

fn on_segment(a: (f32, f32), b: (f32, f32), p: (f32, f32)) -> bool {
    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
    if cross.abs() > f32::EPSILON * 16.0 {
        return false;
    }
    p.0 >= a.0.min(b.0) && p.0 <= a.0.max(b.0) && p.1 >= a.1.min(b.1) && p.1 <= a.1.max(b.1)
}

/// Anything that can find markers in a frame.
pub trait MarkerDetector: Send {
    fn detect(&mut self, frame: &VideoFrame) -> Vec<Marker>;
}

/// A detector that reports the same configured regions for every frame.
/// Handy when the targets are fixed in the scene camera's view, and for
/// running the pipeline without a vision backend.
#[derive(Debug, Clone, Default)]
pub struct FixedRegions {
    regions: Vec<Marker>,
}

impl FixedRegions {
    pub fn new(regions: Vec<Marker>) -> Self {
        Self { regions }
    }
}

impl MarkerDetector for FixedRegions {
    fn detect(&mut self, _frame: &VideoFrame) -> Vec<Marker> {
        self.regions.clone()
    }
}

/// The first marker whose outline strictly contains the point.
pub fn marker_at(markers: &[Marker], x: f32, y: f32) -> Option<MarkerId> {
    markers.iter().find(|m| m.contains(x, y)).map(|m| m.id)
}
