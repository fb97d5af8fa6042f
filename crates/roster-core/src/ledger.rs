//! Daily attendance ledger.
//!
//! One JSON file per calendar day at `<root>/<YYYY-MM-DD>/records.json`
//! holding an array of [`AttendanceRecord`]. A code appears at most once per
//! day: the first commit that sees it wins.

use chrono::{Local, NaiveDate, NaiveTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::types::UNKNOWN_CODE;

const RECORDS_FILE: &str = "records.json";
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt ledger {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("cannot encode ledger: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
}

/// One student's attendance for a day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub code: String,
    pub name: String,
    /// Time of day of the first sighting, `HH:MM:SS`.
    pub time: String,
    pub confidence: f32,
    pub status: AttendanceStatus,
}

/// A recognized student offered for commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognized {
    pub code: String,
    pub name: String,
    pub confidence: f32,
}

/// Outcome of a commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitSummary {
    pub date: String,
    pub time: String,
    pub new_registrations: usize,
    pub total_present: usize,
    pub message: String,
}

/// File-backed ledger with per-day mutual exclusion.
pub struct AttendanceLedger {
    root: PathBuf,
    day_locks: Mutex<HashMap<NaiveDate, Arc<Mutex<()>>>>,
}

impl AttendanceLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            day_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the ledger file for `day`.
    pub fn day_path(&self, day: NaiveDate) -> PathBuf {
        self.root
            .join(day.format(DATE_FORMAT).to_string())
            .join(RECORDS_FILE)
    }

    /// Run `f` while holding the lock for `day`. The table entry is dropped
    /// again once no other commit for that day holds or waits on it, so the
    /// table only ever holds days with a commit in flight.
    fn with_day_lock<T>(&self, day: NaiveDate, f: impl FnOnce() -> T) -> T {
        let lock = Arc::clone(self.day_locks.lock().entry(day).or_default());
        let result = {
            let _guard = lock.lock();
            f()
        };

        let mut locks = self.day_locks.lock();
        // One reference in the table, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&day);
        }
        result
    }

    /// Records for `day`, empty if nothing was committed that day.
    ///
    /// Takes no lock: commits publish the day's file with a rename, so a
    /// read sees either the previous or the next complete file.
    pub fn records(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        read_records(&self.day_path(day))
    }

    /// Commit recognized students for `day`, stamped with the current local time.
    pub fn commit(&self, day: NaiveDate, recognized: &[Recognized]) -> Result<CommitSummary, LedgerError> {
        self.commit_at(day, Local::now().time(), recognized)
    }

    /// Commit recognized students for `day` at an explicit time of day.
    ///
    /// `UNKNOWN` entries and codes already present for the day are skipped.
    /// The day's file is rewritten through a temp file and rename, so readers
    /// never see a partial write.
    pub fn commit_at(
        &self,
        day: NaiveDate,
        time: NaiveTime,
        recognized: &[Recognized],
    ) -> Result<CommitSummary, LedgerError> {
        let date = day.format(DATE_FORMAT).to_string();
        let time = time.format(TIME_FORMAT).to_string();
        let path = self.day_path(day);

        let (new_registrations, total_present) = self.with_day_lock(day, || {
            let mut records = read_records(&path)?;
            let mut present: HashSet<String> = records.iter().map(|r| r.code.clone()).collect();

            let mut new_registrations = 0;
            for face in recognized {
                if face.code == UNKNOWN_CODE || present.contains(&face.code) {
                    continue;
                }
                present.insert(face.code.clone());
                records.push(AttendanceRecord {
                    code: face.code.clone(),
                    name: face.name.clone(),
                    time: time.clone(),
                    confidence: face.confidence,
                    status: AttendanceStatus::Present,
                });
                new_registrations += 1;
            }

            write_records(&path, &records)?;
            Ok::<_, LedgerError>((new_registrations, records.len()))
        })?;

        let message = if new_registrations == 0 {
            "All recognized students are already registered today".to_string()
        } else {
            format!("Attendance recorded for {new_registrations} new students")
        };

        tracing::info!(
            date = %date,
            new_registrations,
            total_present,
            "attendance committed"
        );

        Ok(CommitSummary {
            date,
            time,
            new_registrations,
            total_present,
            message,
        })
    }

    #[cfg(test)]
    fn tracked_days(&self) -> usize {
        self.day_locks.lock().len()
    }
}

fn read_records(path: &Path) -> Result<Vec<AttendanceRecord>, LedgerError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(LedgerError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&raw).map_err(|source| LedgerError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Write to a unique temp file in the same directory, fsync, then rename.
fn write_records(path: &Path, records: &[AttendanceRecord]) -> Result<(), LedgerError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| LedgerError::Io { path, source }
    };
    fs::create_dir_all(dir).map_err(io_err(dir))?;

    let json = serde_json::to_vec_pretty(records)?;
    let tmp = dir.join(format!(".{RECORDS_FILE}.{}.tmp", uuid::Uuid::new_v4()));

    let written = fs::File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(&tmp, path));

    if let Err(source) = written {
        let _ = fs::remove_file(&tmp);
        return Err(LedgerError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
