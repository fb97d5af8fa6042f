//! Service context shared by every request handler.

use chrono::NaiveDateTime;
use image::DynamicImage;
use roster_core::gallery::{LoadError, LoadReport};
use roster_core::ledger::{AttendanceRecord, CommitSummary, LedgerError, Recognized};
use roster_core::{
    recognition, AttendanceLedger, CosineMatcher, DetectorError, FaceRecognition, GalleryStore,
    LandmarkDetector, LandmarkSet,
};
use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;

/// Owns the gallery, the ledger, the detector and the configuration.
pub struct AppState {
    pub config: Config,
    pub gallery: GalleryStore,
    pub ledger: AttendanceLedger,
    detector: Arc<dyn LandmarkDetector>,
    matcher: CosineMatcher,
}

/// Faces recognized in one image, with the meshes used for drawing.
pub struct RecognitionOutcome {
    pub faces: Vec<FaceRecognition>,
    pub meshes: Vec<LandmarkSet>,
    pub width: u32,
    pub height: u32,
}

/// Gallery counters reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Status {
    pub students_loaded: usize,
    pub system_ready: bool,
    pub similarity_threshold: f32,
    pub features_loaded: usize,
}

/// A registered student as listed by the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentSummary {
    pub code: String,
    pub name: String,
    pub registration_date: String,
    pub frames_count: u32,
    pub features: usize,
}

impl AppState {
    /// Build the context. The gallery starts empty; call
    /// [`reload_gallery`](Self::reload_gallery) to load it.
    pub fn new(config: Config, detector: Arc<dyn LandmarkDetector>) -> Self {
        Self {
            gallery: GalleryStore::new(config.students_dir.clone()),
            ledger: AttendanceLedger::new(config.attendance_dir.clone()),
            config,
            detector,
            matcher: CosineMatcher,
        }
    }

    /// Detect and recognize every face in `image` against the current gallery
    /// snapshot. Blocking.
    pub fn recognize_image(&self, image: &DynamicImage) -> Result<RecognitionOutcome, DetectorError> {
        let detections = self.detector.detect(image)?;
        let snapshot = self.gallery.snapshot();
        let faces = recognition::recognize(
            &detections,
            &snapshot,
            &self.matcher,
            self.config.similarity_threshold,
        );

        let known = faces.iter().filter(|f| f.is_known()).count();
        tracing::debug!(faces = faces.len(), known, "recognition complete");

        Ok(RecognitionOutcome {
            faces,
            meshes: detections.landmarks,
            width: image.width(),
            height: image.height(),
        })
    }

    /// Record attendance for the day of `now`. Blocking.
    pub fn commit_attendance(
        &self,
        now: NaiveDateTime,
        faces: &[Recognized],
    ) -> Result<CommitSummary, LedgerError> {
        self.ledger.commit_at(now.date(), now.time(), faces)
    }

    /// Rebuild the gallery from disk. Blocking.
    pub fn reload_gallery(&self) -> LoadReport {
        self.gallery.reload(self.detector.as_ref())
    }

    pub fn status(&self) -> Status {
        let snapshot = self.gallery.snapshot();
        Status {
            students_loaded: snapshot.len(),
            system_ready: !snapshot.is_empty(),
            similarity_threshold: self.config.similarity_threshold,
            features_loaded: snapshot.identities_with_features(),
        }
    }

    pub fn students(&self) -> Vec<StudentSummary> {
        self.gallery
            .snapshot()
            .entries()
            .iter()
            .map(|e| StudentSummary {
                code: e.identity.code.clone(),
                name: e.identity.name.clone(),
                registration_date: e.identity.registration_date.clone(),
                frames_count: e.identity.frames_count,
                features: e.features.len(),
            })
            .collect()
    }

    /// Write a new student to disk and reload the gallery. Blocking.
    pub fn register_student(&self, code: &str, name: &str, frames: &[Vec<u8>]) -> Result<LoadReport, LoadError> {
        self.gallery.register(code, name, frames)?;
        Ok(self.reload_gallery())
    }

    /// Attendance records for one day. Blocking.
    pub fn attendance(&self, day: chrono::NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        self.ledger.records(day)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::NaiveDate;
    use roster_core::UNKNOWN_CODE;

    const RED: [u8; 3] = [220, 20, 20];

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 2)
            .unwrap()
            .and_hms_opt(9, 15, 0)
            .unwrap()
    }

    #[test]
    fn test_status_before_and_after_registration() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());
        assert_eq!(
            state.status(),
            Status {
                students_loaded: 0,
                system_ready: false,
                similarity_threshold: 0.7,
                features_loaded: 0,
            }
        );

        let report = state.register_student("S1", "Alice", &[png(RED)]).unwrap();
        assert_eq!(report.students, 1);
        let status = state.status();
        assert_eq!(status.students_loaded, 1);
        assert!(status.system_ready);
        assert_eq!(status.features_loaded, 1);

        let students = state.students();
        assert_eq!(students.len(), 1);
        assert_eq!(students[0].code, "S1");
        assert_eq!(students[0].frames_count, 1);
        assert_eq!(students[0].features, 1);
    }

    #[test]
    fn test_recognize_then_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());
        state.register_student("S1", "Alice", &[png(RED)]).unwrap();

        let image = image::load_from_memory(&png(RED)).unwrap();
        let outcome = state.recognize_image(&image).unwrap();
        assert_eq!(outcome.faces.len(), 1);
        assert_eq!(outcome.faces[0].code, "S1");
        assert_eq!((outcome.width, outcome.height), (16, 8));
        assert_eq!(outcome.meshes.len(), 1);

        let recognized: Vec<Recognized> = outcome
            .faces
            .iter()
            .map(|f| Recognized {
                code: f.code.clone(),
                name: f.name.clone(),
                confidence: f.confidence,
            })
            .collect();
        let first = state.commit_attendance(now(), &recognized).unwrap();
        assert_eq!(first.new_registrations, 1);
        let second = state.commit_attendance(now(), &recognized).unwrap();
        assert_eq!(second.new_registrations, 0);
        assert_eq!(second.total_present, 1);

        let records = state.attendance(now().date()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].time, "09:15:00");
    }

    #[test]
    fn test_image_without_faces() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());
        state.register_student("S1", "Alice", &[png(RED)]).unwrap();

        let image = image::load_from_memory(&png([0, 0, 0])).unwrap();
        let outcome = state.recognize_image(&image).unwrap();
        assert!(outcome.faces.is_empty());
        assert!(outcome.meshes.is_empty());
    }

    #[test]
    fn test_commit_skips_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());
        let faces = [Recognized {
            code: UNKNOWN_CODE.into(),
            name: "Unknown".into(),
            confidence: 0.4,
        }];
        let summary = state.commit_attendance(now(), &faces).unwrap();
        assert_eq!(summary.new_registrations, 0);
        assert_eq!(summary.total_present, 0);
    }
}
