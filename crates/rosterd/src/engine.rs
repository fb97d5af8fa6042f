use image::DynamicImage;
use roster_core::{Detections, DetectorError, LandmarkDetector, MeshPipeline};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("cannot spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Detect {
        image: DynamicImage,
        reply: oneshot::Sender<Result<Detections, DetectorError>>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// Implements [`LandmarkDetector`] by blocking on the engine's reply, so it
/// must be called from a blocking context (`spawn_blocking` or a plain thread).
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl LandmarkDetector for EngineHandle {
    fn detect(&self, image: &DynamicImage) -> Result<Detections, DetectorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(EngineRequest::Detect {
                image: image.clone(),
                reply: reply_tx,
            })
            .map_err(|_| DetectorError::Unavailable("engine thread exited".into()))?;
        reply_rx
            .blocking_recv()
            .map_err(|_| DetectorError::Unavailable("engine thread exited".into()))?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads both ONNX models synchronously and fails fast if either is
/// unavailable; the sessions then live on the engine thread for good.
pub fn spawn_engine(
    scrfd_path: &str,
    mesh_path: &str,
    min_confidence: f32,
    max_faces: usize,
) -> Result<EngineHandle, EngineError> {
    let mut pipeline = MeshPipeline::load(scrfd_path, mesh_path, min_confidence, max_faces)?;
    tracing::info!(scrfd = scrfd_path, mesh = mesh_path, max_faces, "landmark models loaded");

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("roster-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { image, reply } => {
                        let result = pipeline.detect(&image);
                        if let Err(e) = &result {
                            tracing::warn!(error = %e, "detection failed");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}
