use anyhow::{bail, Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "roster", about = "Roster face attendance CLI")]
struct Cli {
    /// Base URL of the rosterd HTTP API
    #[arg(long, global = true, default_value = "http://127.0.0.1:5000", env = "ROSTER_SERVER")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show gallery status
    Status,
    /// Reload the student gallery from disk
    Reload,
    /// Recognize the faces in an image
    Recognize {
        /// Image file (jpg or png)
        image: PathBuf,
        /// Record attendance for the recognized students
        #[arg(long)]
        commit: bool,
    },
    /// Show attendance records for a day
    Attendance {
        /// Day as YYYY-MM-DD (default: today)
        #[arg(short, long)]
        date: Option<String>,
    },
    /// List registered students
    Students,
    /// Register a student from one or more face images
    Register {
        /// Student code (directory name)
        #[arg(short, long)]
        code: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Face images
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
}

#[derive(Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct StatusReply {
    students_loaded: usize,
    features_loaded: usize,
    system_ready: bool,
    similarity_threshold: f32,
}

#[derive(Deserialize)]
struct ReloadReply {
    message: String,
}

#[derive(Deserialize)]
struct Face {
    name: String,
    code: String,
    confidence: f32,
}

#[derive(Deserialize)]
struct RecognizeReply {
    faces: Vec<Face>,
    total_faces: usize,
}

#[derive(Deserialize)]
struct CommitReply {
    message: String,
    total_present: usize,
}

#[derive(Deserialize)]
struct Record {
    code: String,
    name: String,
    time: String,
    confidence: f32,
}

#[derive(Deserialize)]
struct DayReply {
    date: String,
    records: Vec<Record>,
}

#[derive(Deserialize)]
struct Student {
    code: String,
    name: String,
    registration_date: String,
    frames_count: u32,
    features: usize,
}

#[derive(Deserialize)]
struct StudentsReply {
    students: Vec<Student>,
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("cannot reach rosterd at {url}"))?;
        decode(resp).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T> {
        let url = format!("{}{path}", self.base);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("cannot reach rosterd at {url}"))?;
        decode(resp).await
    }
}

/// Parse a reply, turning `{"success": false, "error": ...}` into an error.
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("invalid JSON reply")?;
    let envelope: Envelope = serde_json::from_value(body.clone()).context("unexpected reply")?;
    if !envelope.success {
        bail!(
            "rosterd returned {status}: {}",
            envelope.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    Ok(serde_json::from_value(body)?)
}

fn data_url(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        _ => "image/jpeg",
    };
    Ok(format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.server);

    match cli.command {
        Commands::Status => {
            let s: StatusReply = client.get("/api/status").await?;
            println!("ready:      {}", s.system_ready);
            println!("students:   {}", s.students_loaded);
            println!("with faces: {}", s.features_loaded);
            println!("threshold:  {:.2}", s.similarity_threshold);
        }
        Commands::Reload => {
            let r: ReloadReply = client.post("/api/students/reload", json!({})).await?;
            println!("{}", r.message);
        }
        Commands::Recognize { image, commit } => {
            let r: RecognizeReply = client
                .post("/api/recognize_with_mesh", json!({ "image": data_url(&image)? }))
                .await?;
            println!("{} face(s)", r.total_faces);
            for f in &r.faces {
                println!("  {:<12} {:<24} {:.3}", f.code, f.name, f.confidence);
            }
            if commit {
                let faces: Vec<_> = r
                    .faces
                    .iter()
                    .map(|f| json!({ "code": f.code, "name": f.name, "confidence": f.confidence }))
                    .collect();
                let c: CommitReply = client.post("/api/attendance", json!({ "faces": faces })).await?;
                println!("{} ({} present)", c.message, c.total_present);
            }
        }
        Commands::Attendance { date } => {
            let date = date.unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string());
            let d: DayReply = client.get(&format!("/api/attendance/{date}")).await?;
            println!("{}: {} present", d.date, d.records.len());
            for r in &d.records {
                println!("  {}  {:<12} {:<24} {:.3}", r.time, r.code, r.name, r.confidence);
            }
        }
        Commands::Students => {
            let s: StudentsReply = client.get("/api/students").await?;
            if s.students.is_empty() {
                println!("No students registered");
            }
            for st in &s.students {
                println!(
                    "{:<12} {:<24} frames={} features={} registered={}",
                    st.code, st.name, st.frames_count, st.features, st.registration_date
                );
            }
        }
        Commands::Register { code, name, images } => {
            let frames = images
                .iter()
                .map(|p| data_url(p))
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(frames = frames.len(), "uploading frames");
            let r: ReloadReply = client
                .post(
                    "/api/students",
                    json!({ "code": code, "name": name, "frames": frames }),
                )
                .await?;
            println!("{}", r.message);
        }
    }

    Ok(())
}
