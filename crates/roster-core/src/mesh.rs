//! Face-mesh landmark model via ONNX Runtime.
//!
//! Runs a 468-point face-mesh model on a square crop around each SCRFD
//! detection and maps the landmarks back to image-relative coordinates.

use crate::detector::{DetectorError, FaceDetector, PixelDetection};
use crate::types::{Detections, Landmark, LandmarkSet};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

// --- Named constants ---
const MESH_INPUT_SIZE: usize = 192;
const MESH_LANDMARKS: usize = 468;
/// Crop side relative to the larger side of the detection box.
const MESH_CROP_SCALE: f32 = 1.5;
const MESH_PRESENCE_THRESHOLD: f32 = 0.5;

/// Mesh connection index lists used to draw the face outline, eyes, nose
/// bridge and lips.
pub const FACE_CONNECTIONS: &[&[usize]] = &[
    &[
        10, 338, 297, 332, 284, 251, 389, 356, 454, 323, 361, 288, 397, 365, 379, 378, 400, 377,
        152, 148, 176, 149, 150, 136, 172, 58, 132, 93, 234, 127, 162, 21, 54, 103, 67, 109, 10,
    ],
    &[
        33, 7, 163, 144, 145, 153, 154, 155, 133, 173, 157, 158, 159, 160, 161, 246, 33,
    ],
    &[
        362, 382, 381, 380, 374, 373, 390, 249, 263, 466, 388, 387, 386, 385, 384, 398, 362,
    ],
    &[
        168, 8, 9, 10, 151, 195, 197, 196, 3, 51, 48, 115, 131, 134, 102, 48, 64,
    ],
    &[
        61, 84, 17, 314, 405, 320, 307, 375, 321, 308, 324, 318, 402, 317, 14, 87, 178, 88, 95,
        61,
    ],
];

/// Square crop in source-image pixels. May extend past the image edges.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CropRegion {
    x0: f32,
    y0: f32,
    side: f32,
}

impl CropRegion {
    fn around(det: &PixelDetection) -> Self {
        let side = det.width.max(det.height) * MESH_CROP_SCALE;
        let cx = det.x + det.width / 2.0;
        let cy = det.y + det.height / 2.0;
        Self {
            x0: cx - side / 2.0,
            y0: cy - side / 2.0,
            side,
        }
    }
}

/// Face-mesh landmark model.
pub struct FaceMesh {
    session: Session,
}

impl FaceMesh {
    /// Load the face-mesh ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face mesh model"
        );

        Ok(Self { session })
    }

    /// Run the mesh on the crop around `det`. Returns `None` when the model's
    /// face-presence score says the crop holds no face.
    fn landmarks(
        &mut self,
        image: &RgbImage,
        det: &PixelDetection,
    ) -> Result<Option<LandmarkSet>, DetectorError> {
        let crop = CropRegion::around(det);
        let input = Self::preprocess(image, &crop);
        let has_presence = self.session.outputs().len() > 1;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("mesh landmarks: {e}")))?;

        if raw.len() < MESH_LANDMARKS * 3 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected {} landmark values, got {}",
                MESH_LANDMARKS * 3,
                raw.len()
            )));
        }

        if has_presence {
            let (_, presence) = outputs[1]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("mesh presence: {e}")))?;
            if let Some(&logit) = presence.first() {
                let score = sigmoid(logit);
                if score < MESH_PRESENCE_THRESHOLD {
                    tracing::debug!(score, "mesh rejected crop");
                    return Ok(None);
                }
            }
        }

        let (width, height) = image.dimensions();
        Ok(Some(map_landmarks(raw, &crop, width, height)))
    }

    /// Sample the crop into a NHWC float tensor scaled to [0, 1].
    /// Pixels outside the image are black.
    fn preprocess(image: &RgbImage, crop: &CropRegion) -> Array4<f32> {
        let size = MESH_INPUT_SIZE;
        let (width, height) = image.dimensions();
        let step = crop.side / size as f32;
        let mut tensor = Array4::<f32>::zeros((1, size, size, 3));

        for v in 0..size {
            let sy = (crop.y0 + (v as f32 + 0.5) * step).floor();
            if sy < 0.0 || sy >= height as f32 {
                continue;
            }
            for u in 0..size {
                let sx = (crop.x0 + (u as f32 + 0.5) * step).floor();
                if sx < 0.0 || sx >= width as f32 {
                    continue;
                }
                let pixel = image.get_pixel(sx as u32, sy as u32);
                for c in 0..3 {
                    tensor[[0, v, u, c]] = pixel[c] as f32 / 255.0;
                }
            }
        }

        tensor
    }
}

/// Map raw model output (x, y, z in crop pixels of the model input) to
/// image-relative landmarks. `z` is scaled like `x`.
fn map_landmarks(raw: &[f32], crop: &CropRegion, image_width: u32, image_height: u32) -> LandmarkSet {
    let scale = crop.side / MESH_INPUT_SIZE as f32;
    let w = image_width.max(1) as f32;
    let h = image_height.max(1) as f32;

    let points = raw
        .chunks_exact(3)
        .take(MESH_LANDMARKS)
        .map(|p| {
            Landmark::new(
                (crop.x0 + p[0] * scale) / w,
                (crop.y0 + p[1] * scale) / h,
                p[2] * scale / w,
            )
        })
        .collect();

    LandmarkSet::new(points)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// SCRFD detection followed by the face mesh on each detected face.
pub struct MeshPipeline {
    detector: FaceDetector,
    mesh: FaceMesh,
    max_faces: usize,
}

impl MeshPipeline {
    pub fn load(
        scrfd_path: &str,
        mesh_path: &str,
        min_confidence: f32,
        max_faces: usize,
    ) -> Result<Self, DetectorError> {
        Ok(Self {
            detector: FaceDetector::load(scrfd_path, min_confidence)?,
            mesh: FaceMesh::load(mesh_path)?,
            max_faces,
        })
    }

    /// Detect up to `max_faces` faces, returning a box for every detection
    /// and a landmark set for every face the mesh accepted.
    pub fn detect(&mut self, image: &DynamicImage) -> Result<Detections, DetectorError> {
        let faces = self.detector.detect(image)?;
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();

        let mut detections = Detections::default();
        for det in faces.iter().take(self.max_faces) {
            detections.boxes.push(det.to_relative(width, height));
            if let Some(set) = self.mesh.landmarks(&rgb, det)? {
                detections.landmarks.push(set);
            }
        }

        tracing::debug!(
            faces = detections.boxes.len(),
            meshes = detections.landmarks.len(),
            "mesh pipeline"
        );
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_region_is_square_and_centred() {
        let det = PixelDetection {
            x: 100.0,
            y: 50.0,
            width: 40.0,
            height: 80.0,
            confidence: 0.9,
        };
        let crop = CropRegion::around(&det);
        assert!((crop.side - 120.0).abs() < 1e-4);
        assert!((crop.x0 - 60.0).abs() < 1e-4);
        assert!((crop.y0 + 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_map_landmarks_to_relative() {
        let crop = CropRegion {
            x0: 100.0,
            y0: 50.0,
            side: 192.0,
        };
        let mut raw = vec![0.0f32; MESH_LANDMARKS * 3];
        raw[0..3].copy_from_slice(&[96.0, 96.0, 10.0]);
        let set = map_landmarks(&raw, &crop, 400, 200);
        assert_eq!(set.len(), MESH_LANDMARKS);
        let p = set.get(0).unwrap();
        assert!((p.x - 196.0 / 400.0).abs() < 1e-6);
        assert!((p.y - 146.0 / 200.0).abs() < 1e-6);
        assert!((p.z - 10.0 / 400.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_shape_and_padding() {
        let image = RgbImage::from_pixel(50, 50, image::Rgb([255, 0, 51]));
        let crop = CropRegion {
            x0: -50.0,
            y0: 0.0,
            side: 100.0,
        };
        let tensor = FaceMesh::preprocess(&image, &crop);
        assert_eq!(tensor.shape(), &[1, MESH_INPUT_SIZE, MESH_INPUT_SIZE, 3]);
        // Left half is outside the image.
        assert_eq!(tensor[[0, 10, 10, 0]], 0.0);
        // Right column maps inside the image (rows past 50px fall outside).
        assert!((tensor[[0, 10, 150, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 10, 150, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }

    #[test]
    fn test_face_connections_within_mesh() {
        assert_eq!(FACE_CONNECTIONS.len(), 5);
        assert!(FACE_CONNECTIONS
            .iter()
            .flat_map(|c| c.iter())
            .all(|&i| i < MESH_LANDMARKS));
    }
}
