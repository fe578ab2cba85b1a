use crate::types::{Outcome, RunSummary};
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use time::{OffsetDateTime, UtcOffset};
use tracing::error;

/// "yyyy-MM-dd HH:mm:ss" theo giờ local.
fn format_datetime(now: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

pub fn format_log_line(now: OffsetDateTime, endpoint_name: &str, path: &Path) -> String {
    format!("{} | {} | {}\n", format_datetime(now), endpoint_name, path.display())
}

/// Append-only record of signed files. Opened on first write.
struct AuditLog {
    path: PathBuf,
    file: Option<File>,
    offset: UtcOffset,
}

impl AuditLog {
    fn append(&mut self, endpoint_name: &str, signed: &Path) -> Result<()> {
        if self.file.is_none() {
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("open log {}", self.path.display()))?;
            self.file = Some(f);
        }
        let Some(f) = self.file.as_mut() else {
            return Ok(());
        };

        let now = OffsetDateTime::now_utc().to_offset(self.offset);
        let line = format_log_line(now, endpoint_name, signed);
        f.write_all(line.as_bytes())
            .with_context(|| format!("write log {}", self.path.display()))?;
        f.sync_data()
            .with_context(|| format!("sync log {}", self.path.display()))?;
        Ok(())
    }
}

struct Inner {
    success: usize,
    failed: usize,
    skipped: usize,
    signed_files: Vec<PathBuf>,
    failed_files: Vec<PathBuf>,
    log: AuditLog,
}

/// Shared run state. Every mutation goes through one mutex.
pub struct RunState {
    inner: Mutex<Inner>,
    log_path: PathBuf,
}

impl RunState {
    /// `offset` should be resolved before worker threads start.
    pub fn new(log_path: PathBuf, offset: UtcOffset) -> Self {
        RunState {
            inner: Mutex::new(Inner {
                success: 0,
                failed: 0,
                skipped: 0,
                signed_files: Vec::new(),
                failed_files: Vec::new(),
                log: AuditLog {
                    path: log_path.clone(),
                    file: None,
                    offset,
                },
            }),
            log_path,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Success with a timestamp endpoint: counter, list and log line together.
    pub fn record_signed(&self, path: &Path, endpoint_name: &str) {
        let mut g = self.lock();
        g.success += 1;
        g.signed_files.push(path.to_path_buf());
        if let Err(e) = g.log.append(endpoint_name, path) {
            error!("could not append to signing log: {:#}", e);
        }
    }

    pub fn record(&self, path: &Path, outcome: &Outcome) {
        let mut g = self.lock();
        match outcome {
            Outcome::Success => {
                g.success += 1;
                g.signed_files.push(path.to_path_buf());
            }
            Outcome::Failed { retryable, .. } => {
                g.failed += 1;
                if *retryable {
                    g.failed_files.push(path.to_path_buf());
                }
            }
            Outcome::Skipped { .. } => g.skipped += 1,
        }
    }

    pub fn has_retryable(&self) -> bool {
        !self.lock().failed_files.is_empty()
    }

    /// Drain the retry list. The drained failures are taken back out of the
    /// fail counter since the retry outcome replaces them.
    pub fn take_retry_batch(&self) -> Vec<PathBuf> {
        let mut g = self.lock();
        let batch = std::mem::take(&mut g.failed_files);
        g.failed -= batch.len();
        batch
    }

    pub fn signed_files(&self) -> Vec<PathBuf> {
        self.lock().signed_files.clone()
    }

    pub fn summary(&self) -> RunSummary {
        let g = self.lock();
        RunSummary {
            success: g.success,
            failed: g.failed,
            skipped: g.skipped,
        }
    }
}
