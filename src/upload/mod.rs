//! ChunkedUploadTracker - multi-part uploads assembled into media files
//!
//! Parts may arrive in any order and more than once. Each part is written to
//! `<scratch>/<upload_id>/chunk_<index>`; once every index has been seen the
//! upload moves to Assembling under the registry lock, which is what makes
//! assembly happen exactly once no matter how many submitters race.
//!
//! The registry lock is a plain mutex and is never held across an await.
//! The only file operation under it is the rename that publishes a part.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::bus::{BusMessage, Category, SharedBroadcaster};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Receiving,
    Assembling,
    Completed,
    Failed,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("unknown upload: {0}")]
    UnknownUpload(String),
    #[error("an upload needs at least one part")]
    InvalidPartCount,
    #[error("part {index} out of range for an upload of {total} parts")]
    PartOutOfRange { index: u32, total: u32 },
    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),
    #[error("upload {0} failed and accepts no more parts")]
    UploadFailed(String),
    #[error("upload storage error: {0}")]
    Io(#[from] io::Error),
}

/// Externally visible state of one upload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSnapshot {
    pub upload_id: String,
    pub filename: String,
    pub total_parts: u32,
    pub received_parts: Vec<u32>,
    pub status: UploadStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct UploadEntry {
    filename: String,
    total_parts: u32,
    received: BTreeSet<u32>,
    status: UploadStatus,
    artifact: Option<PathBuf>,
    sha256: Option<String>,
    error: Option<String>,
}

/// What happened to a staged part once the registry lock was taken
enum Published {
    Accepted { snapshot: UploadSnapshot, complete: bool },
    Discarded(UploadSnapshot),
    Failed(io::Error),
}

impl UploadEntry {
    fn progress(&self) -> f64 {
        self.received.len() as f64 / self.total_parts as f64 * 100.0
    }

    fn snapshot(&self, upload_id: &str) -> UploadSnapshot {
        UploadSnapshot {
            upload_id: upload_id.to_string(),
            filename: self.filename.clone(),
            total_parts: self.total_parts,
            received_parts: self.received.iter().copied().collect(),
            status: self.status,
            progress: self.progress(),
            artifact: self.artifact.clone(),
            sha256: self.sha256.clone(),
            error: self.error.clone(),
        }
    }
}

pub struct ChunkedUploadTracker {
    scratch_dir: PathBuf,
    output_dir: PathBuf,
    uploads: Mutex<HashMap<String, UploadEntry>>,
    broadcaster: Option<SharedBroadcaster>,
}

impl ChunkedUploadTracker {
    pub fn new(scratch_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            output_dir: output_dir.into(),
            uploads: Mutex::new(HashMap::new()),
            broadcaster: None,
        }
    }

    /// Publish progress to the `upload` category
    pub fn with_broadcaster(mut self, broadcaster: SharedBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UploadEntry>> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new upload. Only the final path component of `filename` is kept.
    pub fn init(&self, filename: &str, total_parts: u32) -> Result<UploadSnapshot, UploadError> {
        if total_parts == 0 {
            return Err(UploadError::InvalidPartCount);
        }
        let filename = sanitize_filename(filename)?;
        let upload_id = new_upload_id();

        let entry = UploadEntry {
            filename,
            total_parts,
            received: BTreeSet::new(),
            status: UploadStatus::Pending,
            artifact: None,
            sha256: None,
            error: None,
        };
        let snapshot = entry.snapshot(&upload_id);
        self.lock().insert(upload_id.clone(), entry);

        info!(upload_id = %upload_id, filename = %snapshot.filename, total_parts, "Upload started");
        self.notify(&snapshot);
        Ok(snapshot)
    }

    /// Store one part. When this part completes the set, the upload is
    /// assembled before this call returns.
    pub async fn submit_part(
        &self,
        upload_id: &str,
        index: u32,
        bytes: &[u8],
    ) -> Result<UploadSnapshot, UploadError> {
        {
            let mut uploads = self.lock();
            let entry = uploads
                .get_mut(upload_id)
                .ok_or_else(|| UploadError::UnknownUpload(upload_id.to_string()))?;
            if index >= entry.total_parts {
                return Err(UploadError::PartOutOfRange {
                    index,
                    total: entry.total_parts,
                });
            }
            match entry.status {
                UploadStatus::Pending => entry.status = UploadStatus::Receiving,
                UploadStatus::Receiving => {}
                UploadStatus::Failed => return Err(UploadError::UploadFailed(upload_id.to_string())),
                UploadStatus::Assembling | UploadStatus::Completed => {
                    debug!(upload_id, index, "Late part ignored");
                    return Ok(entry.snapshot(upload_id));
                }
            }
        }

        let staged = match self.stage_part(upload_id, index, bytes).await {
            Ok(staged) => staged,
            Err(e) => {
                // Assembly may have removed the part directory underneath us
                let current = self.status(upload_id)?;
                if matches!(current.status, UploadStatus::Assembling | UploadStatus::Completed) {
                    debug!(upload_id, index, "Late part ignored: {}", e);
                    return Ok(current);
                }
                return Err(e.into());
            }
        };

        let (snapshot, assemble) = match self.publish_part(upload_id, index, &staged)? {
            Published::Accepted { snapshot, complete } => (snapshot, complete),
            Published::Discarded(current) => {
                self.discard_staged(upload_id, index, &staged).await;
                return Ok(current);
            }
            Published::Failed(e) => {
                self.discard_staged(upload_id, index, &staged).await;
                return Err(e.into());
            }
        };
        self.notify(&snapshot);

        if !assemble {
            return Ok(snapshot);
        }

        let outcome = self
            .assemble(upload_id, &snapshot.filename, snapshot.total_parts)
            .await;

        let snapshot = {
            let mut uploads = self.lock();
            let entry = uploads
                .get_mut(upload_id)
                .ok_or_else(|| UploadError::UnknownUpload(upload_id.to_string()))?;
            match outcome {
                Ok((artifact, sha256)) => {
                    info!(upload_id, artifact = %artifact.display(), "Upload completed");
                    entry.status = UploadStatus::Completed;
                    entry.artifact = Some(artifact);
                    entry.sha256 = Some(sha256);
                }
                Err(e) => {
                    error!(upload_id, "Upload assembly failed: {}", e);
                    entry.status = UploadStatus::Failed;
                    entry.error = Some(e.to_string());
                }
            }
            entry.snapshot(upload_id)
        };
        self.notify(&snapshot);
        Ok(snapshot)
    }

    pub fn status(&self, upload_id: &str) -> Result<UploadSnapshot, UploadError> {
        self.lock()
            .get(upload_id)
            .map(|entry| entry.snapshot(upload_id))
            .ok_or_else(|| UploadError::UnknownUpload(upload_id.to_string()))
    }

    fn part_dir(&self, upload_id: &str) -> PathBuf {
        self.scratch_dir.join(upload_id)
    }

    /// Write the part under a private name; it is not visible to assembly
    /// until `publish_part` renames it
    async fn stage_part(&self, upload_id: &str, index: u32, bytes: &[u8]) -> io::Result<PathBuf> {
        let dir = self.part_dir(upload_id);
        tokio::fs::create_dir_all(&dir).await?;

        let temp = dir.join(format!(".chunk_{}.{}", index, new_upload_id()));
        if let Err(e) = tokio::fs::write(&temp, bytes).await {
            if let Err(cleanup) = tokio::fs::remove_file(&temp).await {
                debug!(upload_id, index, "Temp part not removed: {}", cleanup);
            }
            return Err(e);
        }
        Ok(temp)
    }

    /// Rename a staged part to `chunk_<index>` and count it, both under the
    /// registry lock. Once the upload has left Receiving the staged file is
    /// handed back untouched.
    fn publish_part(
        &self,
        upload_id: &str,
        index: u32,
        staged: &Path,
    ) -> Result<Published, UploadError> {
        let mut uploads = self.lock();
        let entry = uploads
            .get_mut(upload_id)
            .ok_or_else(|| UploadError::UnknownUpload(upload_id.to_string()))?;

        if entry.status != UploadStatus::Receiving {
            debug!(upload_id, index, status = ?entry.status, "Part arrived after the set was complete");
            return Ok(Published::Discarded(entry.snapshot(upload_id)));
        }

        // Single metadata call; assembly must never see an index without its file
        let part = self.part_dir(upload_id).join(format!("chunk_{}", index));
        if let Err(e) = std::fs::rename(staged, &part) {
            return Ok(Published::Failed(e));
        }

        let duplicate = !entry.received.insert(index);
        let complete = entry.received.len() == entry.total_parts as usize;
        if complete {
            entry.status = UploadStatus::Assembling;
        }
        debug!(
            upload_id,
            index,
            duplicate,
            received = entry.received.len(),
            total = entry.total_parts,
            "Part stored"
        );
        Ok(Published::Accepted {
            snapshot: entry.snapshot(upload_id),
            complete,
        })
    }

    /// Remove a staged part that was never published. The part directory
    /// goes too when nothing else is left in it, so a late submitter does
    /// not resurrect scratch space assembly already cleared.
    async fn discard_staged(&self, upload_id: &str, index: u32, staged: &Path) {
        if let Err(e) = tokio::fs::remove_file(staged).await {
            debug!(upload_id, index, "Staged part not removed: {}", e);
        }
        let _ = tokio::fs::remove_dir(self.part_dir(upload_id)).await;
    }

    /// Concatenate parts in index order into the output directory and drop
    /// the scratch directory. Returns the artifact path and its SHA-256.
    async fn assemble(
        &self,
        upload_id: &str,
        filename: &str,
        total_parts: u32,
    ) -> io::Result<(PathBuf, String)> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let dir = self.part_dir(upload_id);
        let partial = self.output_dir.join(format!(".{}.partial", upload_id));
        let artifact = self.output_dir.join(filename);

        let mut hasher = Sha256::new();
        let written = async {
            let mut out = tokio::fs::File::create(&partial).await?;
            for index in 0..total_parts {
                let bytes = tokio::fs::read(dir.join(format!("chunk_{}", index))).await?;
                hasher.update(&bytes);
                out.write_all(&bytes).await?;
            }
            out.flush().await?;
            out.sync_all().await?;
            Ok::<(), io::Error>(())
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                debug!(upload_id, "Partial artifact not removed: {}", cleanup);
            }
            return Err(e);
        }

        tokio::fs::rename(&partial, &artifact).await?;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(upload_id, "Scratch parts not removed: {}", e);
        }
        Ok((artifact, hex::encode(hasher.finalize())))
    }

    fn notify(&self, snapshot: &UploadSnapshot) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.send(
                Category::Upload,
                &BusMessage::UploadProgress {
                    upload_id: snapshot.upload_id.clone(),
                    progress: snapshot.progress,
                    status: snapshot.status,
                },
            );
        }
    }
}

fn new_upload_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Keep only the final path component
fn sanitize_filename(filename: &str) -> Result<String, UploadError> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(UploadError::InvalidFilename(filename.to_string()));
    }
    Ok(name.to_string())
}
