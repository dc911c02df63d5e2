//! Task-visible log
//!
//! Lines written here end up in the task's log artifact, so they are part of
//! the observable interface. Every line is mirrored to `tracing`.
//! Writes fail open: a broken log file never takes the proxy down.

use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::fail_open::fail_open;
use crate::Result;

/// Artifact name of the task log
pub const LIVE_BACKING_LOG: &str = "public/logs/live_backing.log";

/// Written once per credential rotation observed by the proxy
pub const ROTATION_NOTICE: &str = "Successfully refreshed taskcluster-proxy credentials";

enum Sink {
    Memory(Vec<String>),
    File(File),
}

/// Append-only, line-oriented task log
#[derive(Clone)]
pub struct TaskLog {
    path: Option<PathBuf>,
    sink: Arc<Mutex<Sink>>,
}

impl TaskLog {
    /// In-memory log, mostly for tests and dry runs
    pub fn memory() -> Self {
        Self {
            path: None,
            sink: Arc::new(Mutex::new(Sink::Memory(Vec::new()))),
        }
    }

    /// File-backed log; parent directories are created as needed
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path: Some(path),
            sink: Arc::new(Mutex::new(Sink::File(file))),
        })
    }

    /// Append one line
    pub async fn line(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(target: "task_log", "{}", message);

        let stamped = format!(
            "[tcproxy {}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message
        );

        fail_open("task_log::line", || async {
            match &mut *self.sink.lock().await {
                Sink::Memory(lines) => lines.push(stamped.trim_end().to_string()),
                Sink::File(file) => {
                    file.write_all(stamped.as_bytes()).await?;
                    file.flush().await?;
                }
            }
            Ok(())
        })
        .await;
    }

    /// All lines written so far
    pub async fn lines(&self) -> Vec<String> {
        let sink = self.sink.lock().await;
        match (&*sink, &self.path) {
            (Sink::Memory(lines), _) => lines.clone(),
            (Sink::File(_), Some(path)) => fail_open("task_log::lines", || async {
                let content = tokio::fs::read_to_string(path).await?;
                Ok(content.lines().map(str::to_string).collect())
            })
            .await
            .unwrap_or_default(),
            (Sink::File(_), None) => Vec::new(),
        }
    }

    /// Number of lines containing `needle`
    pub async fn count_containing(&self, needle: &str) -> usize {
        self.lines()
            .await
            .iter()
            .filter(|l| l.contains(needle))
            .count()
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl std::fmt::Debug for TaskLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "TaskLog({})", path.display()),
            None => write!(f, "TaskLog(memory)"),
        }
    }
}
