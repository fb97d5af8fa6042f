//! HTTP JSON API.
//!
//! Routes:
//!
//! - `POST /api/recognize_with_mesh` recognize faces in a data-URL image
//! - `POST /api/attendance`          record attendance for recognized faces
//! - `GET  /api/attendance/{date}`   one day's attendance records
//! - `POST /api/students/reload`     reload the gallery from disk
//! - `GET  /api/students`            list registered students
//! - `POST /api/students`            register a student and reload
//! - `GET  /api/status`              gallery counters
//!
//! Every failure is answered with `{"success": false, "error": "..."}`.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use chrono::{Local, NaiveDate};
use roster_core::ledger::{AttendanceRecord, CommitSummary, LedgerError, Recognized};
use roster_core::{DetectorError, LoadError, PixelBox, FACE_CONNECTIONS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::service::{AppState, RecognitionOutcome, StudentSummary};

/// Registration uploads carry several base64 frames.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/recognize_with_mesh", post(recognize_with_mesh))
        .route("/api/attendance", post(record_attendance))
        .route("/api/attendance/{date}", get(day_attendance))
        .route("/api/students/reload", post(reload_students))
        .route("/api/students", get(list_students).post(register_student))
        .route("/api/status", get(status))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("attendance not recorded: {0}")]
    Ledger(#[from] LedgerError),
    #[error("registration failed: {0}")]
    Registration(#[from] LoadError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Registration(LoadError::InvalidCode(_) | LoadError::Image { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Detector(DetectorError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "bad request");
        }
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct RecognizeRequest {
    /// `data:image/...;base64,<payload>` or bare base64.
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct FaceResponse {
    pub name: String,
    pub code: String,
    pub confidence: f32,
    pub location: PixelBox,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PixelPoint {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Serialize)]
pub struct MeshResponse {
    pub landmarks: Vec<PixelPoint>,
    pub connections: &'static [&'static [usize]],
}

#[derive(Debug, Serialize)]
pub struct RecognizeResponse {
    pub success: bool,
    pub faces: Vec<FaceResponse>,
    pub face_meshes: Vec<MeshResponse>,
    pub total_faces: usize,
}

impl From<RecognitionOutcome> for RecognizeResponse {
    fn from(outcome: RecognitionOutcome) -> Self {
        let (w, h) = (outcome.width, outcome.height);
        let faces: Vec<FaceResponse> = outcome
            .faces
            .into_iter()
            .map(|f| FaceResponse {
                location: f.location.to_pixels(w, h),
                name: f.name,
                code: f.code,
                confidence: f.confidence,
            })
            .collect();
        let face_meshes = outcome
            .meshes
            .iter()
            .map(|set| MeshResponse {
                landmarks: set
                    .points()
                    .iter()
                    .map(|p| PixelPoint {
                        x: (p.x * w as f32) as i32,
                        y: (p.y * h as f32) as i32,
                    })
                    .collect(),
                connections: FACE_CONNECTIONS,
            })
            .collect();
        Self {
            success: true,
            total_faces: faces.len(),
            faces,
            face_meshes,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AttendanceRequest {
    pub faces: Vec<Recognized>,
}

#[derive(Debug, Serialize)]
pub struct AttendanceResponse {
    pub success: bool,
    #[serde(flatten)]
    pub summary: CommitSummary,
}

#[derive(Debug, Serialize)]
pub struct DayAttendanceResponse {
    pub success: bool,
    pub date: String,
    pub records: Vec<AttendanceRecord>,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub success: bool,
    pub message: String,
    pub students_loaded: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub success: bool,
    #[serde(flatten)]
    pub status: crate::service::Status,
}

#[derive(Debug, Serialize)]
pub struct StudentsResponse {
    pub success: bool,
    pub students: Vec<StudentSummary>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub code: String,
    pub name: String,
    /// Data-URL encoded frames.
    pub frames: Vec<String>,
}

/// Decode a data URL (`data:image/jpeg;base64,...`) or bare base64 string.
pub fn decode_data_url(data: &str) -> Result<Vec<u8>, ApiError> {
    let payload = match data.split_once(',') {
        Some((_, payload)) => payload,
        None => data,
    };
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| ApiError::BadRequest(format!("invalid base64 image: {e}")))
}

async fn recognize_with_mesh(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RecognizeRequest>, JsonRejection>,
) -> Result<Json<RecognizeResponse>, ApiError> {
    let Json(req) = payload?;
    let bytes = decode_data_url(&req.image)?;

    let outcome = tokio::task::spawn_blocking(move || -> Result<RecognitionOutcome, ApiError> {
        let image = image::load_from_memory(&bytes)
            .map_err(|e| ApiError::BadRequest(format!("cannot decode image: {e}")))?;
        Ok(state.recognize_image(&image)?)
    })
    .await??;

    Ok(Json(outcome.into()))
}

async fn record_attendance(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AttendanceRequest>, JsonRejection>,
) -> Result<Json<AttendanceResponse>, ApiError> {
    let Json(req) = payload?;
    let now = Local::now().naive_local();
    let summary = tokio::task::spawn_blocking(move || state.commit_attendance(now, &req.faces)).await??;
    Ok(Json(AttendanceResponse {
        success: true,
        summary,
    }))
}

async fn day_attendance(
    State(state): State<Arc<AppState>>,
    Path(date): Path<String>,
) -> Result<Json<DayAttendanceResponse>, ApiError> {
    let day = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|e| ApiError::BadRequest(format!("invalid date {date:?}: {e}")))?;
    let records = tokio::task::spawn_blocking(move || state.attendance(day)).await??;
    Ok(Json(DayAttendanceResponse {
        success: true,
        date: day.format("%Y-%m-%d").to_string(),
        records,
    }))
}

async fn reload_students(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>, ApiError> {
    let report = tokio::task::spawn_blocking(move || state.reload_gallery()).await?;
    Ok(Json(ReloadResponse {
        success: true,
        message: format!("{} students reloaded", report.students),
        students_loaded: report.students,
    }))
}

async fn list_students(State(state): State<Arc<AppState>>) -> Json<StudentsResponse> {
    Json(StudentsResponse {
        success: true,
        students: state.students(),
    })
}

async fn register_student(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let Json(req) = payload?;
    if req.frames.is_empty() {
        return Err(ApiError::BadRequest("at least one frame is required".into()));
    }
    let frames = req
        .frames
        .iter()
        .map(|f| decode_data_url(f))
        .collect::<Result<Vec<_>, _>>()?;

    let code = req.code.clone();
    let report =
        tokio::task::spawn_blocking(move || state.register_student(&req.code, &req.name, &frames)).await??;

    Ok(Json(ReloadResponse {
        success: true,
        message: format!("student {code} registered; {} students loaded", report.students),
        students_loaded: report.students,
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        success: true,
        status: state.status(),
    })
}
