//! Bounded-concurrency bulk download from an object store.

use crate::error::{CloudError, ConvergeError, Result, TransferFailure};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::path::{Component, Path, PathBuf};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Object store calls used by [`sync_to_local`].
#[allow(async_fn_in_trait)] // Send+Sync bounds on trait are sufficient
#[cfg_attr(test, mockall::automock)]
pub trait ObjectSource: Send + Sync {
    /// Every key under `prefix`.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, CloudError>;

    /// Write the object's content to `destination`.
    async fn download(&self, bucket: &str, key: &str, destination: &Path) -> Result<(), CloudError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub bucket: String,
    /// Key prefix without trailing slash; empty syncs the whole bucket
    pub prefix: String,
    pub local_path: PathBuf,
    /// Remove `local_path` before downloading
    pub clean_first: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Local files written, in completion order
    pub files: Vec<PathBuf>,
    /// Directory placeholder keys that were skipped
    pub skipped: usize,
}

/// Listing prefix for a sync: `prefix/`, or everything for an empty prefix.
fn list_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Local path mirroring `key` under `root`, or `None` if the key would
/// escape `root`.
fn local_target(root: &Path, key: &str) -> Option<PathBuf> {
    let relative = Path::new(key);
    let safe = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    safe.then(|| root.join(relative))
}

/// Mirror every object under `prefix/` into `local_path`.
///
/// Each object lands at `local_path/<key>`, with intermediate directories
/// created as needed. Downloads run concurrently on the calling task, at
/// most `max_concurrency` at once.
///
/// # Errors
/// * `Validation` - empty bucket or zero concurrency
/// * `Api`/`Connection` - the listing failed
/// * `BulkTransfer` - one or more objects failed; every failure is listed,
///   first to finish first
pub async fn sync_to_local<S: ObjectSource + ?Sized>(
    source: &S,
    request: &SyncRequest,
    max_concurrency: usize,
) -> Result<SyncReport> {
    if request.bucket.is_empty() {
        return Err(ConvergeError::Validation("bucket is required".to_string()));
    }
    if max_concurrency == 0 {
        return Err(ConvergeError::Validation(
            "max_concurrency must be at least 1".to_string(),
        ));
    }

    let root = &request.local_path;
    if request.clean_first {
        match tokio::fs::remove_dir_all(root).await {
            Ok(()) => debug!(path = %root.display(), "Cleaned destination"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConvergeError::io(root, e)),
        }
    }
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| ConvergeError::io(root, e))?;

    let keys = source
        .list_keys(&request.bucket, &list_prefix(&request.prefix))
        .await
        .map_err(|e| ConvergeError::from_cloud("ListObjects", e))?;

    let mut report = SyncReport::default();
    let mut failures = Vec::new();
    let semaphore = Semaphore::new(max_concurrency);
    let mut downloads = FuturesUnordered::new();

    for key in keys {
        if key.ends_with('/') {
            report.skipped += 1;
            continue;
        }
        let Some(target) = local_target(root, &key) else {
            warn!(key = %key, "Key escapes destination directory, skipping");
            failures.push(TransferFailure {
                key,
                reason: "key is not a relative path".to_string(),
            });
            continue;
        };

        let semaphore = &semaphore;
        let bucket = request.bucket.as_str();
        downloads.push(async move {
            // The semaphore is never closed, so acquire cannot fail
            let _permit = semaphore.acquire().await.ok();
            let result = download_one(source, bucket, &key, &target).await.map(|()| target);
            (key, result)
        });
    }

    let total = downloads.len() + failures.len();
    info!(bucket = %request.bucket, prefix = %request.prefix, objects = total, "Syncing objects");

    while let Some((key, result)) = downloads.next().await {
        match result {
            Ok(path) => report.files.push(path),
            Err(reason) => {
                warn!(key = %key, reason = %reason, "Download failed");
                failures.push(TransferFailure { key, reason });
            }
        }
    }

    if !failures.is_empty() {
        return Err(ConvergeError::BulkTransfer { failures, total });
    }

    info!(files = report.files.len(), skipped = report.skipped, "Sync complete");
    Ok(report)
}

async fn download_one<S: ObjectSource + ?Sized>(
    source: &S,
    bucket: &str,
    key: &str,
    target: &Path,
) -> std::result::Result<(), String> {
    if let Some(parent) = target.parent() {
        // create_dir_all treats an existing directory as success
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("create {}: {e}", parent.display()))?;
    }
    source
        .download(bucket, key, target)
        .await
        .map_err(|e| e.to_string())
}
