// Durable overflow store
//
// Persists a batch to disk when no backend can accept it and replays
// persisted batches through the sender on a background sweep. Files are
// written to a temp name and renamed into place, so a crash between write
// and rename never leaves a partial file that looks complete.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::PendingBatch;
use crate::error::{Error, Result};
use crate::sender::Sender;

const DUMP_EXTENSION: &str = "json";

/// Filesystem-backed overflow store rooted at one directory, one file per
/// undeliverable batch.
#[derive(Debug, Clone)]
pub struct Dumper {
    dir: PathBuf,
}

impl Dumper {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist one batch under a unique name (timestamp plus random
    /// suffix). Atomic against crashes: temp write, then rename.
    pub async fn dump(&self, batch: &PendingBatch) -> Result<PathBuf> {
        let name = format!(
            "dump-{}-{}.{DUMP_EXTENSION}",
            Utc::now().format("%Y%m%dT%H%M%S%3f"),
            Uuid::new_v4().simple()
        );
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{name}.tmp"));

        let payload = serde_json::to_vec(batch).map_err(|source| Error::MalformedDump {
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &path).await?;

        counter!("chbulk.dump.files", 1);
        info!(path = %path.display(), bytes = batch.content.len(), "persisted undeliverable batch");
        Ok(path)
    }

    /// Overflow files currently awaiting replay, in directory order.
    pub fn pending_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(DUMP_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// One sweep: attempt redelivery of every persisted batch. Delivered
    /// files are deleted; failed or unreadable ones stay for the next
    /// sweep. Returns the number of redelivered batches.
    pub async fn replay_once(&self, sender: &Sender) -> Result<usize> {
        let mut redelivered = 0;
        for path in self.pending_files()? {
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to read overflow file");
                    continue;
                }
            };
            let mut batch: PendingBatch = match serde_json::from_slice(&raw) {
                Ok(batch) => batch,
                Err(source) => {
                    let err = Error::MalformedDump {
                        path: path.clone(),
                        source,
                    };
                    warn!(error = %err, "skipping overflow file");
                    continue;
                }
            };
            batch.retries += 1;

            match sender.try_deliver(&batch).await {
                Ok(()) => {
                    tokio::fs::remove_file(&path).await?;
                    counter!("chbulk.dump.replayed", 1);
                    info!(path = %path.display(), retries = batch.retries, "replayed overflow batch");
                    redelivered += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "overflow replay failed; keeping file");
                }
            }
        }
        Ok(redelivered)
    }

    /// Start the background sweep, resubmitting persisted batches every
    /// `check_interval` (clamped to at least one second; zero would panic
    /// the interval timer). Callers opt out of replay by never starting
    /// this.
    pub fn listen(&self, sender: Sender, check_interval: Duration) -> tokio::task::JoinHandle<()> {
        let dumper = self.clone();
        let check_interval = check_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = dumper.replay_once(&sender).await {
                    warn!(error = %err, "overflow sweep failed");
                }
            }
        })
    }
}
