//! Content Sync (pull)
//!
//! Mirrors new and changed files from a pod directory into a local one.
//! Files are compared by size and mtime, downloaded to a `.part` file that a
//! later run resumes from, and renamed into place once complete. The part
//! file is named after the remote size and mtime, so a file that changed on
//! the pod between runs starts over instead of resuming onto the old bytes.
//! Local files are never deleted, only stale part files.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::connection::{ConnectError, ConnectionHandle, ConnectionManager};
use crate::error::{Classify, ErrorClass};
use crate::ssh::shell_escape;

const CHUNK_SIZE: usize = 64 * 1024;
const PART_SUFFIX: &str = ".part";

#[derive(Error, Debug)]
pub enum PullError {
    #[error("None of {failed} changed files could be transferred")]
    NothingTransferred { failed: usize },

    #[error("Connection to pod {0} lost during pull")]
    ConnectionLost(String),

    #[error("Listing {dir} failed: {reason}")]
    Listing { dir: String, reason: String },

    #[error("Local IO error: {0}")]
    LocalIo(#[from] std::io::Error),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

impl Classify for PullError {
    fn class(&self) -> ErrorClass {
        match self {
            PullError::NothingTransferred { .. } => ErrorClass::PartialFailure,
            PullError::ConnectionLost(_) => ErrorClass::ConnectionLost,
            PullError::Connect(e) => e.class(),
            _ => ErrorClass::Fatal,
        }
    }
}

/// One file as listed on the pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Path relative to the pulled directory
    pub rel_path: String,
    pub size: u64,
    /// Seconds since the epoch
    pub mtime: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PullReport {
    pub transferred: Vec<String>,
    pub skipped: usize,
    /// (relative path, reason)
    pub failed: Vec<(String, String)>,
}

impl PullReport {
    pub fn count(&self) -> usize {
        self.transferred.len()
    }
}

/// `find` listing: relative path, size and mtime, tab separated
fn list_command(remote_dir: &str) -> String {
    format!(
        "find {} -type f -printf '%P\\t%s\\t%T@\\n'",
        shell_escape(remote_dir)
    )
}

fn parse_listing(stdout: &str) -> Vec<RemoteFile> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.rsplitn(3, '\t');
            let mtime = fields.next()?.trim().parse::<f64>().ok()?;
            let size = fields.next()?.trim().parse::<u64>().ok()?;
            let rel_path = fields.next()?.to_string();
            if rel_path.is_empty() {
                return None;
            }
            Some(RemoteFile {
                rel_path,
                size,
                mtime: mtime.trunc() as i64,
            })
        })
        .collect()
}

/// Relative path that stays inside the target directory
fn safe_relative(rel: &str) -> Option<PathBuf> {
    let path = Path::new(rel);
    if path
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn mtime_secs(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

async fn is_current(local: &Path, file: &RemoteFile) -> bool {
    match tokio::fs::metadata(local).await {
        Ok(meta) => {
            meta.len() == file.size
                && meta.modified().map(mtime_secs).ok() == Some(file.mtime)
        }
        Err(_) => false,
    }
}

/// `<file>.<mtime>-<size>.part`, tied to one version of the remote file
fn part_path(local: &Path, file: &RemoteFile) -> PathBuf {
    let mut name = local.as_os_str().to_os_string();
    name.push(format!(".{}-{}{}", file.mtime, file.size, PART_SUFFIX));
    PathBuf::from(name)
}

/// True when `candidate` is a part file of `file_name`, whatever the version
fn is_part_of(candidate: &str, file_name: &str) -> bool {
    let Some(version) = candidate
        .strip_prefix(file_name)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(PART_SUFFIX))
    else {
        return false;
    };
    match version.rsplit_once('-') {
        Some((mtime, size)) => mtime.parse::<i64>().is_ok() && size.parse::<u64>().is_ok(),
        None => false,
    }
}

/// Drop part files left by older versions of the same remote file
async fn remove_stale_parts(local: &Path, keep: &Path) {
    let (Some(dir), Some(file_name)) = (local.parent(), local.file_name().and_then(|n| n.to_str()))
    else {
        return;
    };
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_stale = path != keep
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| is_part_of(name, file_name));
        if is_stale {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed stale partial download {}", path.display()),
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
        }
    }
}

/// Pull new and changed files from `remote_dir` into `local_dir`
pub async fn pull(
    connections: &ConnectionManager,
    handle: &ConnectionHandle,
    remote_dir: &str,
    local_dir: &Path,
    chunk_timeout: Duration,
) -> Result<PullReport, PullError> {
    let remote_dir = remote_dir.trim_end_matches('/');
    let listing = connections
        .run_with_reconnect(handle, &list_command(remote_dir))
        .await?;
    if !listing.success() {
        return Err(PullError::Listing {
            dir: remote_dir.to_string(),
            reason: listing.stderr.trim().to_string(),
        });
    }

    let files = parse_listing(&listing.stdout);
    info!(
        "Pulling {} ({} files) from pod {} into {}",
        remote_dir,
        files.len(),
        handle.pod_id(),
        local_dir.display()
    );
    tokio::fs::create_dir_all(local_dir).await?;

    let mut report = PullReport::default();
    let mut reconnected = false;

    for file in files {
        let Some(rel) = safe_relative(&file.rel_path) else {
            warn!("Skipping unsafe remote path {:?}", file.rel_path);
            report
                .failed
                .push((file.rel_path.clone(), "path escapes target directory".into()));
            continue;
        };
        let local = local_dir.join(&rel);
        if is_current(&local, &file).await {
            report.skipped += 1;
            continue;
        }

        let remote = format!("{}/{}", remote_dir, file.rel_path);
        let mut result = download(handle, &remote, &local, &file, chunk_timeout).await;

        if result.is_err() && !handle.is_connected() {
            if reconnected {
                return Err(PullError::ConnectionLost(handle.pod_id().to_string()));
            }
            reconnected = true;
            warn!("Connection lost while pulling {}, reconnecting once", file.rel_path);
            if let Err(e) = connections.reconnect(handle).await {
                warn!("Reconnect during pull failed: {}", e);
                return Err(PullError::ConnectionLost(handle.pod_id().to_string()));
            }
            result = download(handle, &remote, &local, &file, chunk_timeout).await;
        }

        match result {
            Ok(()) => {
                debug!("Pulled {} ({} bytes)", file.rel_path, file.size);
                report.transferred.push(file.rel_path);
            }
            Err(reason) => {
                warn!("Failed to pull {}: {}", file.rel_path, reason);
                report.failed.push((file.rel_path, reason));
            }
        }
    }

    if report.transferred.is_empty() && !report.failed.is_empty() {
        return Err(PullError::NothingTransferred {
            failed: report.failed.len(),
        });
    }

    info!(
        "Pull from pod {} done: {} transferred, {} up to date, {} failed",
        handle.pod_id(),
        report.transferred.len(),
        report.skipped,
        report.failed.len()
    );
    Ok(report)
}

/// Download one file through its `.part` sibling. Errors are reported as text
/// since they only end up in the report.
async fn download(
    handle: &ConnectionHandle,
    remote: &str,
    local: &Path,
    file: &RemoteFile,
    chunk_timeout: Duration,
) -> Result<(), String> {
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("create {}: {}", parent.display(), e))?;
    }

    let part = part_path(local, file);
    remove_stale_parts(local, &part).await;
    let mut offset = tokio::fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);
    if offset > file.size {
        offset = 0;
    }

    let mut local_file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(offset > 0)
        .truncate(offset == 0)
        .open(&part)
        .await
        .map_err(|e| format!("open {}: {}", part.display(), e))?;

    if offset > 0 {
        info!("Resuming {} at byte {}", remote, offset);
    }

    let mut reader = handle
        .transport()
        .open_read(remote, offset)
        .await
        .map_err(|e| e.to_string())?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut transferred = offset;
    loop {
        let n = match tokio::time::timeout(chunk_timeout, reader.read(&mut buffer)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                let _ = local_file.flush().await;
                return Err(format!("read failed at byte {}: {}", transferred, e));
            }
            Err(_) => {
                let _ = local_file.flush().await;
                return Err(format!("no data for {:?} at byte {}", chunk_timeout, transferred));
            }
        };
        if n == 0 {
            break;
        }
        match tokio::time::timeout(chunk_timeout, local_file.write_all(&buffer[..n])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(format!("write {}: {}", part.display(), e)),
            Err(_) => return Err(format!("local write timed out after {:?}", chunk_timeout)),
        }
        transferred += n as u64;
    }
    local_file
        .flush()
        .await
        .map_err(|e| format!("flush {}: {}", part.display(), e))?;
    drop(local_file);

    if transferred != file.size {
        return Err(format!(
            "size mismatch: expected {} bytes, got {}",
            file.size, transferred
        ));
    }

    let modified = UNIX_EPOCH + Duration::from_secs(file.mtime.max(0) as u64);
    let part_for_mtime = part.clone();
    tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&part_for_mtime)
            .and_then(|f| f.set_modified(modified))
    })
    .await
    .map_err(|e| e.to_string())?
    .map_err(|e| format!("set mtime on {}: {}", part.display(), e))?;

    tokio::fs::rename(&part, local)
        .await
        .map_err(|e| format!("rename into {}: {}", local.display(), e))?;
    Ok(())
}
