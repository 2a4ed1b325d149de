//! Frame-third zone classification

use crate::domain::types::Zone;

/// Splits a frame of fixed width into Left/Middle/Right thirds.
///
/// Bounds are rounded to whole pixels, so a 640px frame gives
/// `x < 213` Left, `x < 427` Middle, otherwise Right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneClassifier {
    left_end: f32,
    middle_end: f32,
}

impl ZoneClassifier {
    pub fn new(frame_width: u32) -> Self {
        let width = frame_width as f32;
        Self { left_end: (width / 3.0).round(), middle_end: (width * 2.0 / 3.0).round() }
    }

    #[inline]
    pub fn classify(&self, x: f32) -> Zone {
        if x < self.left_end {
            Zone::Left
        } else if x < self.middle_end {
            Zone::Middle
        } else {
            Zone::Right
        }
    }
}

impl Default for ZoneClassifier {
    fn default() -> Self {
        Self::new(640)
    }
}
