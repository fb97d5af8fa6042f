use std::net::SocketAddr;
use std::path::PathBuf;

use roster_core::detector::DEFAULT_MIN_CONFIDENCE;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on (default: 127.0.0.1:5000).
    pub bind_addr: SocketAddr,
    /// One directory per registered student.
    pub students_dir: PathBuf,
    /// One directory per day with that day's attendance records.
    pub attendance_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Rescaled cosine similarity a match must exceed.
    pub similarity_threshold: f32,
    /// Minimum SCRFD score for a face box.
    pub detection_confidence: f32,
    /// Maximum faces processed per image.
    pub max_faces: usize,
}

impl Config {
    /// Load configuration from `ROSTER_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("ROSTER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));

        let students_dir = std::env::var("ROSTER_STUDENTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("students"));

        let attendance_dir = std::env::var("ROSTER_ATTENDANCE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance"));

        let model_dir = std::env::var("ROSTER_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| roster_core::default_model_dir());

        let bind_addr = std::env::var("ROSTER_BIND_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 5000)));

        Self {
            bind_addr,
            students_dir,
            attendance_dir,
            model_dir,
            similarity_threshold: env_f32("ROSTER_SIMILARITY_THRESHOLD", 0.7),
            detection_confidence: env_f32("ROSTER_DETECTION_CONFIDENCE", DEFAULT_MIN_CONFIDENCE),
            max_faces: env_usize("ROSTER_MAX_FACES", 5),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the face-mesh landmark model.
    pub fn mesh_model_path(&self) -> String {
        self.model_dir
            .join("face_mesh.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Create the storage roots if they are missing. Failures are logged and
    /// leave the service running with an empty gallery.
    pub fn ensure_dirs(&self) {
        for dir in [&self.students_dir, &self.attendance_dir] {
            if dir.is_dir() {
                continue;
            }
            match std::fs::create_dir_all(dir) {
                Ok(()) => tracing::info!(dir = %dir.display(), "created data directory"),
                Err(e) => tracing::error!(dir = %dir.display(), error = %e, "cannot create data directory"),
            }
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_dirs_creates_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            students_dir: tmp.path().join("data/students"),
            attendance_dir: tmp.path().join("data/attendance"),
            model_dir: tmp.path().join("models"),
            similarity_threshold: 0.7,
            detection_confidence: 0.5,
            max_faces: 5,
        };
        config.ensure_dirs();
        assert!(config.students_dir.is_dir());
        assert!(config.attendance_dir.is_dir());
        assert!(config.scrfd_model_path().ends_with("models/det_10g.onnx"));
    }
}
