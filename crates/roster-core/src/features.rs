//! Landmark feature extraction.
//!
//! Turns a face-mesh landmark set into a fixed-policy feature vector: the
//! coordinates of a small set of key points followed by two derived
//! measurements (eye distance and face height).

use crate::types::{FeatureVector, LandmarkSet};
use thiserror::Error;

// --- Face-mesh landmark indices ---
/// Key points, in output order: face centre and nose, eye corners, mouth
/// corners, chin, cheeks.
pub const KEY_POINTS: [usize; 17] = [
    10, 151, 9, 8, 168, // centre line and nose bridge
    33, 133, 362, 398, // eye corners
    61, 291, // mouth corners
    13, 14, 15, 16, // lips and chin
    21, 251, // cheeks
];
const LEFT_EYE: usize = 33;
const RIGHT_EYE: usize = 362;
const FACE_TOP: usize = 10;
const FACE_BOTTOM: usize = 152;

/// Derived measurements are only computed for sets with more landmarks than this.
pub const MIN_LANDMARKS_FOR_MEASUREMENTS: usize = 168;

/// Number of derived measurements appended after the key-point coordinates.
pub const DERIVED_MEASUREMENTS: usize = 2;

/// Length of a non-degraded feature vector.
pub const FEATURE_DIM: usize = KEY_POINTS.len() * 3 + DERIVED_MEASUREMENTS;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("landmark set is empty")]
    Empty,
    #[error("none of the key points are present in a set of {0} landmarks")]
    NoKeyPoints(usize),
    #[error("non-finite value at landmark {index}")]
    NonFinite { index: usize },
}

/// Extract a feature vector from a landmark set.
///
/// Key points whose index is out of range are skipped and the result is
/// flagged `degraded`; so is a vector from a set too small for the derived
/// measurements. Pure: the same input always yields the same output.
pub fn extract(landmarks: &LandmarkSet) -> Result<FeatureVector, ExtractionError> {
    if landmarks.is_empty() {
        return Err(ExtractionError::Empty);
    }

    let mut values = Vec::with_capacity(FEATURE_DIM);
    let mut missing = 0usize;

    for &index in KEY_POINTS.iter() {
        let Some(p) = landmarks.get(index) else {
            missing += 1;
            continue;
        };
        if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
            return Err(ExtractionError::NonFinite { index });
        }
        values.extend([p.x, p.y, p.z]);
    }

    if values.is_empty() {
        return Err(ExtractionError::NoKeyPoints(landmarks.len()));
    }

    let measured = match measurements(landmarks) {
        Some([eye_distance, face_height]) => {
            if !(eye_distance.is_finite() && face_height.is_finite()) {
                return Err(ExtractionError::NonFinite { index: FACE_BOTTOM });
            }
            values.extend([eye_distance, face_height]);
            true
        }
        None => false,
    };

    let degraded = missing > 0 || !measured;
    if degraded {
        tracing::debug!(
            landmarks = landmarks.len(),
            missing_key_points = missing,
            measured,
            "degraded feature vector"
        );
    }

    Ok(FeatureVector { values, degraded })
}

/// Eye distance (2D) and absolute face height, when the set is large enough.
fn measurements(landmarks: &LandmarkSet) -> Option<[f32; 2]> {
    if landmarks.len() <= MIN_LANDMARKS_FOR_MEASUREMENTS {
        return None;
    }
    let left_eye = landmarks.get(LEFT_EYE)?;
    let right_eye = landmarks.get(RIGHT_EYE)?;
    let top = landmarks.get(FACE_TOP)?;
    let bottom = landmarks.get(FACE_BOTTOM)?;

    let eye_distance = ((left_eye.x - right_eye.x).powi(2) + (left_eye.y - right_eye.y).powi(2)).sqrt();
    let face_height = (top.y - bottom.y).abs();
    Some([eye_distance, face_height])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Landmark;

    /// Synthetic mesh where landmark i sits at a position derived from i.
    fn synthetic_mesh(n: usize) -> LandmarkSet {
        LandmarkSet::new(
            (0..n)
                .map(|i| {
                    let t = i as f32 / n as f32;
                    Landmark::new(0.2 + 0.6 * t, 0.1 + 0.8 * (1.0 - t), 0.01 * t)
                })
                .collect(),
        )
    }

    #[test]
    fn test_full_mesh_vector_length() {
        let fv = extract(&synthetic_mesh(468)).unwrap();
        assert_eq!(fv.len(), FEATURE_DIM);
        assert_eq!(fv.len(), 53);
        assert!(!fv.degraded);
    }

    #[test]
    fn test_key_point_order() {
        let mesh = synthetic_mesh(468);
        let fv = extract(&mesh).unwrap();
        for (slot, &index) in KEY_POINTS.iter().enumerate() {
            let p = mesh.get(index).unwrap();
            assert_eq!(&fv.values[slot * 3..slot * 3 + 3], &[p.x, p.y, p.z]);
        }
    }

    #[test]
    fn test_derived_measurements() {
        let mesh = synthetic_mesh(468);
        let fv = extract(&mesh).unwrap();
        let l = mesh.get(33).unwrap();
        let r = mesh.get(362).unwrap();
        let eye = ((l.x - r.x).powi(2) + (l.y - r.y).powi(2)).sqrt();
        let height = (mesh.get(10).unwrap().y - mesh.get(152).unwrap().y).abs();
        assert!((fv.values[51] - eye).abs() < 1e-6);
        assert!((fv.values[52] - height).abs() < 1e-6);
    }

    #[test]
    fn test_deterministic() {
        let mesh = synthetic_mesh(468);
        assert_eq!(extract(&mesh).unwrap(), extract(&mesh).unwrap());
    }

    #[test]
    fn test_short_set_has_no_measurements() {
        // 160 landmarks: key points 168, 362, 398, 291, 251 are out of range
        // and the set is too small for derived measurements.
        let fv = extract(&synthetic_mesh(160)).unwrap();
        assert!(fv.degraded);
        let present = KEY_POINTS.iter().filter(|&&i| i < 160).count();
        assert_eq!(fv.len(), present * 3);
    }

    #[test]
    fn test_measurements_threshold_is_strict() {
        // Exactly 168 landmarks is not enough for the derived measurements.
        let fv = extract(&synthetic_mesh(168)).unwrap();
        let present = KEY_POINTS.iter().filter(|&&i| i < 168).count();
        assert_eq!(fv.len(), present * 3);
        assert!(fv.degraded);
    }

    #[test]
    fn test_empty_set_fails() {
        assert_eq!(extract(&LandmarkSet::new(vec![])), Err(ExtractionError::Empty));
    }

    #[test]
    fn test_tiny_set_without_key_points_fails() {
        let set = synthetic_mesh(5);
        assert_eq!(extract(&set), Err(ExtractionError::NoKeyPoints(5)));
    }

    #[test]
    fn test_non_finite_fails() {
        let mut points = synthetic_mesh(468).points().to_vec();
        points[33].x = f32::NAN;
        let err = extract(&LandmarkSet::new(points)).unwrap_err();
        assert_eq!(err, ExtractionError::NonFinite { index: 33 });
    }
}
