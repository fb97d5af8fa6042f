//! Recognition of detector output against a gallery.

use crate::features;
use crate::gallery::Gallery;
use crate::matcher::Matcher;
use crate::types::{Detections, FaceRecognition, RelativeBox, UNKNOWN_CODE, UNKNOWN_NAME};

/// Recognize every face in `detections`.
///
/// With boxes, each box (in order) takes the unused landmark set whose
/// centroid is closest to the box centre. Without boxes, every landmark set
/// is a face located by its landmark extent. Faces whose landmarks are
/// missing or unusable are reported as unknown with confidence 0.
pub fn recognize(
    detections: &Detections,
    gallery: &Gallery,
    matcher: &dyn Matcher,
    threshold: f32,
) -> Vec<FaceRecognition> {
    let pairs: Vec<(RelativeBox, Option<usize>)> = if detections.boxes.is_empty() {
        detections
            .landmarks
            .iter()
            .enumerate()
            .filter_map(|(i, set)| set.bounds().map(|b| (b, Some(i))))
            .collect()
    } else {
        pair_boxes(detections)
    };

    pairs
        .into_iter()
        .map(|(location, landmarks_index)| {
            let unknown = |confidence: f32| FaceRecognition {
                code: UNKNOWN_CODE.to_string(),
                name: UNKNOWN_NAME.to_string(),
                confidence,
                location,
                landmarks_index,
            };

            let Some(set) = landmarks_index.map(|i| &detections.landmarks[i]) else {
                return unknown(0.0);
            };
            let probe = match features::extract(set) {
                Ok(probe) => probe,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping face without usable landmarks");
                    return unknown(0.0);
                }
            };

            let result = matcher.compare(&probe, gallery, threshold);
            match result.identity {
                Some(identity) => FaceRecognition {
                    code: identity.code,
                    name: identity.name,
                    confidence: result.similarity,
                    location,
                    landmarks_index,
                },
                None => unknown(result.similarity),
            }
        })
        .collect()
}

/// Greedy nearest-centroid assignment of landmark sets to boxes.
fn pair_boxes(detections: &Detections) -> Vec<(RelativeBox, Option<usize>)> {
    let centroids: Vec<Option<(f32, f32)>> = detections.landmarks.iter().map(|s| s.centroid()).collect();
    let mut used = vec![false; centroids.len()];

    detections
        .boxes
        .iter()
        .map(|b| {
            let (bx, by) = b.center();
            let nearest = centroids
                .iter()
                .enumerate()
                .filter(|(i, _)| !used[*i])
                .filter_map(|(i, c)| c.map(|(cx, cy)| (i, (cx - bx).powi(2) + (cy - by).powi(2))))
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i);
            if let Some(i) = nearest {
                used[i] = true;
            }
            (*b, nearest)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryEntry;
    use crate::matcher::CosineMatcher;
    use crate::types::{Identity, Landmark, LandmarkSet};

    /// 468-point mesh centred on (cx, cy) with a shape selected by `seed`.
    fn mesh(cx: f32, cy: f32, seed: f32) -> LandmarkSet {
        LandmarkSet::new(
            (0..468)
                .map(|i| {
                    let t = i as f32 * 0.1 + seed;
                    Landmark::new(cx + 0.05 * t.sin(), cy + 0.05 * t.cos(), 0.01 * (t * 3.0).sin())
                })
                .collect(),
        )
    }

    fn bx(xmin: f32, ymin: f32) -> RelativeBox {
        RelativeBox {
            xmin,
            ymin,
            width: 0.2,
            height: 0.2,
            confidence: 0.9,
        }
    }

    fn gallery_of(sets: &[(&str, &LandmarkSet)]) -> Gallery {
        let mut g = Gallery::default();
        for (code, set) in sets {
            g.insert(GalleryEntry {
                identity: Identity {
                    code: code.to_string(),
                    name: format!("name-{code}"),
                    registration_date: String::new(),
                    frames_count: 1,
                },
                features: vec![features::extract(set).unwrap()],
            });
        }
        g
    }

    #[test]
    fn test_boxes_pair_with_nearest_mesh() {
        let alice = mesh(0.2, 0.2, 0.0);
        let bob = mesh(0.7, 0.7, 2.0);
        let gallery = gallery_of(&[("S1", &alice), ("S2", &bob)]);

        // Landmark order differs from box order.
        let detections = Detections {
            landmarks: vec![bob.clone(), alice.clone()],
            boxes: vec![bx(0.1, 0.1), bx(0.6, 0.6)],
        };
        let faces = recognize(&detections, &gallery, &CosineMatcher, 0.7);
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].code, "S1");
        assert_eq!(faces[0].landmarks_index, Some(1));
        assert_eq!(faces[0].location, bx(0.1, 0.1));
        assert_eq!(faces[1].code, "S2");
        assert_eq!(faces[1].name, "name-S2");
        assert!((faces[1].confidence - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_extra_box_without_mesh_is_unknown() {
        let alice = mesh(0.2, 0.2, 0.0);
        let gallery = gallery_of(&[("S1", &alice)]);
        let detections = Detections {
            landmarks: vec![alice.clone()],
            boxes: vec![bx(0.1, 0.1), bx(0.6, 0.6)],
        };
        let faces = recognize(&detections, &gallery, &CosineMatcher, 0.7);
        assert_eq!(faces[0].code, "S1");
        assert_eq!(faces[1].code, UNKNOWN_CODE);
        assert_eq!(faces[1].name, UNKNOWN_NAME);
        assert_eq!(faces[1].confidence, 0.0);
        assert!(!faces[1].is_known());
    }

    #[test]
    fn test_without_boxes_uses_landmark_extent() {
        let alice = mesh(0.5, 0.5, 0.0);
        let gallery = gallery_of(&[("S1", &alice)]);
        let detections = Detections {
            landmarks: vec![alice.clone()],
            boxes: vec![],
        };
        let faces = recognize(&detections, &gallery, &CosineMatcher, 0.7);
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].location, alice.bounds().unwrap());
    }

    #[test]
    fn test_unmatched_face_reports_best_score() {
        let alice = mesh(0.5, 0.5, 0.0);
        let gallery = gallery_of(&[("S1", &alice)]);
        let detections = Detections {
            landmarks: vec![mesh(0.5, 0.5, 1.3)],
            boxes: vec![],
        };
        // Threshold above any achievable score.
        let faces = recognize(&detections, &gallery, &CosineMatcher, 1.0);
        assert_eq!(faces[0].code, UNKNOWN_CODE);
        assert!(faces[0].confidence > 0.0);
    }

    #[test]
    fn test_empty_gallery_is_unknown_zero() {
        let detections = Detections {
            landmarks: vec![mesh(0.5, 0.5, 0.0)],
            boxes: vec![bx(0.4, 0.4)],
        };
        let faces = recognize(&detections, &Gallery::default(), &CosineMatcher, 0.7);
        assert_eq!(faces[0].code, UNKNOWN_CODE);
        assert_eq!(faces[0].confidence, 0.0);
    }
}
