//! roster-core: landmark-feature face matching and the daily attendance ledger.
//!
//! Faces arrive as face-mesh landmark sets (from [`mesh::MeshPipeline`] or any
//! other [`LandmarkDetector`]), are reduced to feature vectors, matched
//! against the registered-student [`Gallery`], and committed to the
//! per-day [`AttendanceLedger`].

pub mod detector;
pub mod features;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod mesh;
pub mod recognition;
pub mod types;

pub use detector::{DetectorError, LandmarkDetector};
pub use gallery::{Gallery, GalleryEntry, GalleryStore, LoadError, LoadReport};
pub use ledger::{AttendanceLedger, AttendanceRecord, CommitSummary, LedgerError, Recognized};
pub use matcher::{CosineMatcher, Matcher};
pub use mesh::{MeshPipeline, FACE_CONNECTIONS};
pub use types::{
    Detections, FaceRecognition, FeatureVector, Identity, Landmark, LandmarkSet, MatchResult,
    PixelBox, RelativeBox, UNKNOWN_CODE, UNKNOWN_NAME,
};

/// Default directory for the ONNX model files.
pub fn default_model_dir() -> std::path::PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        });
    data_dir.join("roster/models")
}
