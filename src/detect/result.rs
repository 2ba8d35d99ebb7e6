use serde::{Deserialize, Serialize};

/// Box corners in normalized `0..1` image coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    /// Pixel rectangle `(x, y, width, height)` clamped to the image bounds.
    pub fn to_pixels(&self, width: u32, height: u32) -> (i32, i32, u32, u32) {
        let clamp = |v: f32| v.clamp(0.0, 1.0);
        let x0 = (clamp(self.x_min) * width as f32) as i32;
        let y0 = (clamp(self.y_min) * height as f32) as i32;
        let x1 = (clamp(self.x_max) * width as f32) as i32;
        let y1 = (clamp(self.y_max) * height as f32) as i32;
        (
            x0,
            y0,
            (x1 - x0).max(1) as u32,
            (y1 - y0).max(1) as u32,
        )
    }
}

/// One object reported by a detector backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: u32,
    pub score: f32,
}

/// Per-image counts for the classes of interest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassTally {
    pub cars: u32,
    pub trucks: u32,
    pub people: u32,
}
