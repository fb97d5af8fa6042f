//! Registered-student gallery.
//!
//! On disk the gallery is one directory per student under a students root:
//!
//! ```text
//! students/
//!   S001/
//!     info.json        {"code", "name", "registrationDate", "framesCount"}
//!     frame_00.jpg
//!     frame_01.jpg
//! ```
//!
//! [`GalleryStore`] keeps the loaded gallery behind an `Arc` so a reload can
//! build a complete replacement off to the side and publish it with a single
//! pointer swap. Readers holding a snapshot keep the gallery they started with.

use crate::detector::{DetectorError, LandmarkDetector};
use crate::features::{self, ExtractionError};
use crate::types::{FeatureVector, Identity, UNKNOWN_CODE};
use image::DynamicImage;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Metadata file expected in every student directory.
pub const INFO_FILE: &str = "info.json";
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("missing info.json in {}", .0.display())]
    MissingMetadata(PathBuf),
    #[error("invalid metadata in {}: {source}", .path.display())]
    InvalidMetadata {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid student code {0:?}")]
    InvalidCode(String),
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot decode image {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("detection failed on {}: {source}", .path.display())]
    Detection {
        path: PathBuf,
        source: DetectorError,
    },
    #[error("no face found in {}", .0.display())]
    NoFace(PathBuf),
    #[error("no usable landmarks in {}: {source}", .path.display())]
    Extraction {
        path: PathBuf,
        source: ExtractionError,
    },
}

/// Contents of `info.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentInfo {
    pub code: String,
    pub name: String,
    pub registration_date: String,
    #[serde(default)]
    pub frames_count: u32,
}

impl From<StudentInfo> for Identity {
    fn from(info: StudentInfo) -> Self {
        Identity {
            code: info.code,
            name: info.name,
            registration_date: info.registration_date,
            frames_count: info.frames_count,
        }
    }
}

/// One registered identity and its reference vectors.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: Identity,
    pub features: Vec<FeatureVector>,
}

/// Registered identities in canonical order (sorted directory name at load).
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    by_code: HashMap<String, usize>,
}

impl Gallery {
    /// Insert an entry. A code that is already present is replaced in place
    /// (last write wins); returns `true` in that case.
    pub fn insert(&mut self, entry: GalleryEntry) -> bool {
        match self.by_code.get(&entry.identity.code) {
            Some(&idx) => {
                tracing::warn!(
                    code = %entry.identity.code,
                    previous = %self.entries[idx].identity.name,
                    replacement = %entry.identity.name,
                    "duplicate student code; keeping the later one"
                );
                self.entries[idx] = entry;
                true
            }
            None => {
                self.by_code.insert(entry.identity.code.clone(), self.entries.len());
                self.entries.push(entry);
                false
            }
        }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn get(&self, code: &str) -> Option<&GalleryEntry> {
        self.by_code.get(code).map(|&i| &self.entries[i])
    }

    /// Number of registered identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of non-empty reference vectors.
    pub fn feature_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.features.iter().filter(|f| !f.is_empty()).count())
            .sum()
    }

    /// Number of identities with at least one usable reference vector.
    pub fn identities_with_features(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.features.iter().any(|f| !f.is_empty()))
            .count()
    }

    /// Load every student directory under `root`.
    ///
    /// Per-student and per-image failures are logged, recorded in the report
    /// and skipped. A missing or unreadable root yields an empty gallery.
    pub fn load(root: &Path, detector: &dyn LandmarkDetector) -> (Gallery, LoadReport) {
        let mut gallery = Gallery::default();
        let mut report = LoadReport::default();

        let dirs = match student_dirs(root) {
            Ok(dirs) => dirs,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "students directory unavailable; gallery is empty");
                report.root_missing = true;
                return (gallery, report);
            }
        };

        tracing::info!(root = %root.display(), candidates = dirs.len(), "loading students");

        for dir in dirs {
            let identity = match read_identity(&dir) {
                Ok(identity) => identity,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "skipping student");
                    report.skipped_students.push(e);
                    continue;
                }
            };

            let features = load_features(&dir, detector, &mut report);
            let degraded = features.iter().filter(|f| f.degraded).count();
            tracing::info!(
                code = %identity.code,
                name = %identity.name,
                features = features.len(),
                degraded,
                "student loaded"
            );

            if gallery.insert(GalleryEntry { identity, features }) {
                report.duplicate_codes += 1;
            }
        }

        report.students = gallery.len();
        report.features = gallery.feature_count();
        tracing::info!(
            students = report.students,
            features = report.features,
            skipped_students = report.skipped_students.len(),
            skipped_images = report.skipped_images.len(),
            "gallery loaded"
        );
        (gallery, report)
    }
}

/// Counts and skip reasons from one gallery load.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub students: usize,
    pub features: usize,
    pub duplicate_codes: usize,
    pub root_missing: bool,
    pub skipped_students: Vec<LoadError>,
    pub skipped_images: Vec<LoadError>,
}

/// Immediate subdirectories of `root`, sorted by name. Hidden directories
/// (registration staging) are skipped.
fn student_dirs(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn read_identity(dir: &Path) -> Result<Identity, LoadError> {
    let path = dir.join(INFO_FILE);
    if !path.is_file() {
        return Err(LoadError::MissingMetadata(dir.to_path_buf()));
    }
    let raw = fs::read(&path).map_err(|source| LoadError::Io {
        path: path.clone(),
        source,
    })?;
    let info: StudentInfo =
        serde_json::from_slice(&raw).map_err(|source| LoadError::InvalidMetadata { path, source })?;
    validate_code(&info.code)?;

    if dir.file_name().and_then(|n| n.to_str()) != Some(info.code.as_str()) {
        tracing::debug!(dir = %dir.display(), code = %info.code, "directory name differs from student code");
    }
    Ok(info.into())
}

/// Codes become directory names and must never collide with the unknown sentinel.
pub fn validate_code(code: &str) -> Result<(), LoadError> {
    let trimmed = code.trim();
    if trimmed.is_empty()
        || trimmed != code
        || code == UNKNOWN_CODE
        || code == "."
        || code == ".."
        || code.contains(['/', '\\'])
    {
        return Err(LoadError::InvalidCode(code.to_string()));
    }
    Ok(())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|ok| e.eq_ignore_ascii_case(ok)))
        .unwrap_or(false)
}

fn load_features(dir: &Path, detector: &dyn LandmarkDetector, report: &mut LoadReport) -> Vec<FeatureVector> {
    let mut images: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_image(path))
            .collect(),
        Err(source) => {
            report.skipped_images.push(LoadError::Io {
                path: dir.to_path_buf(),
                source,
            });
            return Vec::new();
        }
    };
    images.sort();

    let mut features = Vec::new();
    for path in images {
        match features_from_image(&path, detector) {
            Ok(found) => features.extend(found),
            Err(e) => {
                tracing::debug!(error = %e, "skipping image");
                report.skipped_images.push(e);
            }
        }
    }
    features
}

/// One feature vector per face in the image.
fn features_from_image(path: &Path, detector: &dyn LandmarkDetector) -> Result<Vec<FeatureVector>, LoadError> {
    let image = image::open(path).map_err(|source| LoadError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    let detections = detector.detect(&image).map_err(|source| LoadError::Detection {
        path: path.to_path_buf(),
        source,
    })?;
    if detections.landmarks.is_empty() {
        return Err(LoadError::NoFace(path.to_path_buf()));
    }

    let mut features = Vec::new();
    let mut first_error = None;
    for set in &detections.landmarks {
        match features::extract(set) {
            Ok(fv) if !fv.is_empty() => features.push(fv),
            Ok(_) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match (features.is_empty(), first_error) {
        (true, Some(source)) => Err(LoadError::Extraction {
            path: path.to_path_buf(),
            source,
        }),
        _ => Ok(features),
    }
}

/// Write a student directory: `info.json` plus one JPEG per frame.
///
/// The directory is built under a hidden staging name next to `<root>/<code>`
/// and renamed into place, so a re-registered code keeps its previous
/// directory untouched until the new one is complete. Every frame must decode
/// as an image. The gallery is not reloaded here.
pub fn register_student(root: &Path, code: &str, name: &str, frames: &[Vec<u8>]) -> Result<Identity, LoadError> {
    validate_code(code)?;

    let decoded = frames
        .iter()
        .enumerate()
        .map(|(i, bytes)| {
            image::load_from_memory(bytes).map_err(|source| LoadError::Image {
                path: PathBuf::from(frame_file_name(i)),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    fs::create_dir_all(root).map_err(io_error(root))?;

    let staging = root.join(format!(".{code}.{}.tmp", uuid::Uuid::new_v4()));
    let staged = stage_student(&staging, code, name, &decoded)
        .and_then(|info| replace_dir(&staging, &root.join(code)).map(|()| info));
    let info = match staged {
        Ok(info) => info,
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    tracing::info!(code, name, frames = frames.len(), "student registered");
    Ok(info.into())
}

fn stage_student(dir: &Path, code: &str, name: &str, frames: &[DynamicImage]) -> Result<StudentInfo, LoadError> {
    fs::create_dir(dir).map_err(io_error(dir))?;

    for (i, image) in frames.iter().enumerate() {
        let path = dir.join(frame_file_name(i));
        image
            .to_rgb8()
            .save_with_format(&path, image::ImageFormat::Jpeg)
            .map_err(|source| LoadError::Image {
                path: path.clone(),
                source,
            })?;
    }

    let info = StudentInfo {
        code: code.to_string(),
        name: name.to_string(),
        registration_date: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        frames_count: frames.len() as u32,
    };
    let info_path = dir.join(INFO_FILE);
    let json = serde_json::to_vec_pretty(&info).map_err(|source| LoadError::InvalidMetadata {
        path: info_path.clone(),
        source,
    })?;
    fs::File::create(&info_path)
        .and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        })
        .map_err(io_error(&info_path))?;

    Ok(info)
}

/// Move `staging` to `target`. An existing `target` is moved aside first and
/// put back if the final rename fails.
fn replace_dir(staging: &Path, target: &Path) -> Result<(), LoadError> {
    let backup = staging.with_extension("old");
    let had_previous = match fs::rename(target, &backup) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(source) => {
            return Err(LoadError::Io {
                path: target.to_path_buf(),
                source,
            })
        }
    };

    if let Err(source) = fs::rename(staging, target) {
        if had_previous {
            let _ = fs::rename(&backup, target);
        }
        return Err(LoadError::Io {
            path: target.to_path_buf(),
            source,
        });
    }

    if had_previous {
        if let Err(e) = fs::remove_dir_all(&backup) {
            tracing::warn!(dir = %backup.display(), error = %e, "cannot remove previous student directory");
        }
    }
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LoadError {
    let path = path.to_path_buf();
    move |source| LoadError::Io { path, source }
}

fn frame_file_name(index: usize) -> String {
    format!("frame_{index:02}.jpg")
}

/// Shared, atomically swappable gallery.
pub struct GalleryStore {
    root: PathBuf,
    current: RwLock<Arc<Gallery>>,
    reload_lock: Mutex<()>,
}

impl GalleryStore {
    /// An empty store for `root`; call [`reload`](Self::reload) to populate it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current: RwLock::new(Arc::new(Gallery::default())),
            reload_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The currently published gallery.
    pub fn snapshot(&self) -> Arc<Gallery> {
        Arc::clone(&self.current.read())
    }

    /// Register a student under this store's root. Shares the reload lock, so
    /// registrations are serialized with each other and with reloads.
    pub fn register(&self, code: &str, name: &str, frames: &[Vec<u8>]) -> Result<Identity, LoadError> {
        let _guard = self.reload_lock.lock();
        register_student(&self.root, code, name, frames)
    }

    /// Rebuild the gallery from disk and publish it. Concurrent reloads run
    /// one at a time; readers are only blocked for the pointer swap.
    pub fn reload(&self, detector: &dyn LandmarkDetector) -> LoadReport {
        let _guard = self.reload_lock.lock();
        let (gallery, report) = Gallery::load(&self.root, detector);
        *self.current.write() = Arc::new(gallery);
        report
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::detector::{DetectorError, LandmarkDetector};
    use crate::types::{Detections, Landmark, LandmarkSet};
    use image::{DynamicImage, Rgb, RgbImage};
    use std::path::Path;
    use std::time::Duration;

    /// Deterministic 468-point mesh derived from a colour.
    pub fn mesh_for_colour(rgb: [u8; 3]) -> LandmarkSet {
        let [r, g, b] = rgb.map(|c| c as f32 / 255.0);
        LandmarkSet::new(
            (0..468)
                .map(|i| {
                    let t = i as f32;
                    Landmark::new(
                        0.5 + 0.4 * (t * 0.37 + r * 5.0).sin(),
                        0.5 + 0.4 * (t * 0.11 + g * 7.0).cos(),
                        0.1 * (t * 0.05 + b * 3.0).sin(),
                    )
                })
                .collect(),
        )
    }

    /// Fake detector: one face per image whose mesh is derived from the
    /// top-left pixel; a black pixel means no face.
    #[derive(Default)]
    pub struct ColourDetector {
        pub delay: Option<Duration>,
    }

    impl LandmarkDetector for ColourDetector {
        fn detect(&self, image: &DynamicImage) -> Result<Detections, DetectorError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let rgb = image.to_rgb8();
            let px = rgb.get_pixel(0, 0).0;
            let mut detections = Detections::default();
            if px != [0, 0, 0] {
                detections.landmarks.push(mesh_for_colour(px));
            }
            Ok(detections)
        }
    }

    pub fn write_image(path: &Path, rgb: [u8; 3]) {
        RgbImage::from_pixel(8, 8, Rgb(rgb)).save(path).unwrap();
    }

    pub fn write_student(root: &Path, code: &str, name: &str, colours: &[[u8; 3]]) {
        let dir = root.join(code);
        std::fs::create_dir_all(&dir).unwrap();
        let info = serde_json::json!({
            "code": code,
            "name": name,
            "registrationDate": "2024-03-01T08:00:00.000Z",
            "framesCount": colours.len(),
        });
        std::fs::write(dir.join("info.json"), info.to_string()).unwrap();
        for (i, &c) in colours.iter().enumerate() {
            write_image(&dir.join(format!("frame_{i:02}.png")), c);
        }
    }
}
