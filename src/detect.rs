//! Detection records published by the vision loop.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::clock;

/// Axis-aligned box in pipeline coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    #[serde(default)]
    pub score: f32,
}

impl TargetBox {
    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Grows the box by `margin` (a fraction of its size) on every side and
    /// clips the result to `space`.
    pub fn inflated(&self, margin: f32, space: (f32, f32)) -> Roi {
        let mx = self.w * margin;
        let my = self.h * margin;
        let x = (self.x - mx).max(0.0);
        let y = (self.y - my).max(0.0);
        let w = (self.w + 2.0 * mx).min(space.0 - x);
        let h = (self.h + 2.0 * my).min(space.1 - y);
        Roi {
            x: x as u32,
            y: y as u32,
            w: w.max(0.0) as u32,
            h: h.max(0.0) as u32,
        }
    }
}

/// Region of interest handed back to the pipeline to crop inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Immutable per-frame result of a pipeline invocation.
///
/// Once published on the bus a detection is never mutated; consumers clone
/// the snapshot they need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub ok: bool,
    /// Monotonic seconds at publish time.
    pub timestamp: f64,
    /// Pipeline coordinate space as `(width, height)` pixels.
    pub frame_space: (f32, f32),
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<TargetBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<(f32, f32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(default)]
    pub targets: Vec<TargetBox>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ancillary: HashMap<String, serde_json::Value>,
}

impl Detection {
    /// A frame with nothing in it.
    pub fn miss(frame_space: (f32, f32)) -> Self {
        Self {
            ok: false,
            timestamp: clock::now(),
            frame_space,
            bbox: None,
            center: None,
            score: None,
            targets: Vec::new(),
            ancillary: HashMap::new(),
        }
    }

    /// Largest target by area, the one the tracker follows.
    pub fn largest_target(&self) -> Option<&TargetBox> {
        self.targets
            .iter()
            .max_by(|a, b| a.area().total_cmp(&b.area()))
    }

    /// Checks that every populated box lies inside `frame_space`.
    pub fn in_bounds(&self) -> bool {
        let (sw, sh) = self.frame_space;
        let fits = |b: &TargetBox| {
            b.x >= 0.0 && b.y >= 0.0 && b.x + b.w <= sw && b.y + b.h <= sh
        };
        self.bbox.iter().all(&fits) && self.targets.iter().all(&fits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(x: f32, y: f32, w: f32, h: f32) -> TargetBox {
        TargetBox {
            x,
            y,
            w,
            h,
            score: 1.0,
        }
    }

    #[test]
    fn picks_largest_target() {
        let mut det = Detection::miss((640.0, 480.0));
        det.ok = true;
        det.targets = vec![boxed(0.0, 0.0, 10.0, 10.0), boxed(5.0, 5.0, 30.0, 20.0)];
        let largest = det.largest_target().unwrap();
        assert_eq!(largest.w, 30.0);
    }

    #[test]
    fn inflated_roi_clips_to_space() {
        let b = boxed(0.0, 0.0, 100.0, 100.0);
        let roi = b.inflated(0.2, (110.0, 110.0));
        assert_eq!(roi.x, 0);
        assert_eq!(roi.y, 0);
        assert_eq!(roi.w, 110);
        assert_eq!(roi.h, 110);
    }

    #[test]
    fn bounds_check_flags_overflow() {
        let mut det = Detection::miss((100.0, 100.0));
        det.ok = true;
        det.targets = vec![boxed(90.0, 0.0, 20.0, 10.0)];
        assert!(!det.in_bounds());
        det.targets = vec![boxed(80.0, 0.0, 20.0, 10.0)];
        assert!(det.in_bounds());
    }
}
