use serde::{Deserialize, Serialize};

/// Code reported for faces that did not clear the similarity threshold.
pub const UNKNOWN_CODE: &str = "UNKNOWN";
/// Display name paired with [`UNKNOWN_CODE`].
pub const UNKNOWN_NAME: &str = "Unknown";

/// A single facial keypoint in normalized image coordinates.
///
/// `x` and `y` are relative to image width and height; `z` is depth on
/// roughly the same scale as `x`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// All landmarks produced for one face in one frame (468 for the face mesh).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSet {
    points: Vec<Landmark>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Landmark>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Landmark> {
        self.points.get(index)
    }

    pub fn points(&self) -> &[Landmark] {
        &self.points
    }

    /// Mean (x, y) of all landmarks, or `None` for an empty set.
    pub fn centroid(&self) -> Option<(f32, f32)> {
        if self.points.is_empty() {
            return None;
        }
        let n = self.points.len() as f32;
        let (sx, sy) = self
            .points
            .iter()
            .fold((0.0f32, 0.0f32), |(sx, sy), p| (sx + p.x, sy + p.y));
        Some((sx / n, sy / n))
    }

    /// Tight box around the landmarks, clamped to the image.
    pub fn bounds(&self) -> Option<RelativeBox> {
        let first = self.points.first()?;
        let (mut x0, mut y0, mut x1, mut y1) = (first.x, first.y, first.x, first.y);
        for p in &self.points[1..] {
            x0 = x0.min(p.x);
            y0 = y0.min(p.y);
            x1 = x1.max(p.x);
            y1 = y1.max(p.y);
        }
        Some(RelativeBox::from_corners(x0, y0, x1, y1))
    }
}

/// Face bounding box with coordinates relative to image size (0–1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelativeBox {
    pub xmin: f32,
    pub ymin: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl RelativeBox {
    pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        let xmin = x0.clamp(0.0, 1.0);
        let ymin = y0.clamp(0.0, 1.0);
        Self {
            xmin,
            ymin,
            width: (x1.clamp(0.0, 1.0) - xmin).max(0.0),
            height: (y1.clamp(0.0, 1.0) - ymin).max(0.0),
            confidence: 1.0,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.xmin + self.width / 2.0, self.ymin + self.height / 2.0)
    }

    /// Convert to pixel edges for an image of the given size.
    pub fn to_pixels(&self, image_width: u32, image_height: u32) -> PixelBox {
        let left = (self.xmin * image_width as f32) as i32;
        let top = (self.ymin * image_height as f32) as i32;
        let w = (self.width * image_width as f32) as i32;
        let h = (self.height * image_height as f32) as i32;
        PixelBox {
            top,
            right: left + w,
            bottom: top + h,
            left,
        }
    }
}

/// Face location in pixel edges, as drawn by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

/// Numeric summary of a face used for comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f32>,
    /// True when some key points were out of range for the landmark set, or
    /// the derived measurements could not be computed.
    pub degraded: bool,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            degraded: false,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Rescaled cosine similarity in [0, 1]. See [`crate::matcher::similarity`].
    pub fn similarity(&self, other: &FeatureVector) -> f32 {
        crate::matcher::similarity(&self.values, &other.values)
    }
}

/// A registered student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub code: String,
    pub name: String,
    pub registration_date: String,
    pub frames_count: u32,
}

/// Result of matching a probe vector against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, if the best score cleared the threshold.
    pub identity: Option<Identity>,
    /// Best similarity observed [0, 1], reported even without a match.
    pub similarity: f32,
}

impl MatchResult {
    pub fn no_match(similarity: f32) -> Self {
        Self {
            identity: None,
            similarity,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// Output of a landmark detector for one image.
///
/// Boxes and landmark sets are reported independently; they need not be
/// the same length or in the same order.
#[derive(Debug, Clone, Default)]
pub struct Detections {
    pub landmarks: Vec<LandmarkSet>,
    pub boxes: Vec<RelativeBox>,
}

/// Outcome of recognizing one detected face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceRecognition {
    pub code: String,
    pub name: String,
    pub confidence: f32,
    pub location: RelativeBox,
    /// Index into [`Detections::landmarks`] used for this face.
    pub landmarks_index: Option<usize>,
}

impl FaceRecognition {
    pub fn is_known(&self) -> bool {
        self.code != UNKNOWN_CODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centroid() {
        let set = LandmarkSet::new(vec![
            Landmark::new(0.0, 0.0, 0.0),
            Landmark::new(1.0, 0.5, 0.0),
        ]);
        assert_eq!(set.centroid(), Some((0.5, 0.25)));
        assert_eq!(LandmarkSet::new(vec![]).centroid(), None);
    }

    #[test]
    fn test_bounds_clamped() {
        let set = LandmarkSet::new(vec![
            Landmark::new(-0.1, 0.2, 0.0),
            Landmark::new(0.6, 1.3, 0.0),
        ]);
        let b = set.bounds().unwrap();
        assert_eq!(b.xmin, 0.0);
        assert!((b.ymin - 0.2).abs() < 1e-6);
        assert!((b.width - 0.6).abs() < 1e-6);
        assert!((b.height - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_to_pixels() {
        let b = RelativeBox {
            xmin: 0.25,
            ymin: 0.5,
            width: 0.5,
            height: 0.25,
            confidence: 0.9,
        };
        let px = b.to_pixels(640, 480);
        assert_eq!(
            px,
            PixelBox {
                top: 240,
                right: 480,
                bottom: 360,
                left: 160
            }
        );
    }
}
