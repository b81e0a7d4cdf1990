//! Local unpacking of downloaded archives.
//!
//! The extraction directory is keyed by the project key. Creating it is the
//! last line of duplicate detection: if it already exists the archive is
//! treated as scanned before.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    error::{Result, ScanError},
    scan::{ports::RetrievedArtifact, request::ProjectKey},
};

/// Directory holding the unpacked sources of one project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedSource {
    pub project: ProjectKey,
    pub root: PathBuf,
}

impl ExtractedSource {
    /// Best-effort removal, used when a run fails after extraction.
    pub async fn remove(&self) {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!(path = %self.root.display(), "removed extracted sources"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.root.display(),
                error = %err,
                "failed to remove extracted sources"
            ),
        }
    }
}

const COPY_CHUNK: usize = 64 * 1024;

/// Unpack `artifact` into `work_dir/<project>` within `limit`.
///
/// Fails with [`ScanError::AlreadyProcessed`] when the target exists. A target
/// created by this call is removed again if unpacking fails or runs past
/// `limit`. On timeout the blocking unzip is told to stop and is awaited
/// before the directory is removed, so nothing is written into it afterwards.
pub async fn extract_artifact(
    artifact: &RetrievedArtifact,
    work_dir: &Path,
    project: &ProjectKey,
    limit: Duration,
) -> Result<ExtractedSource> {
    let root = work_dir.join(project.as_str());

    tokio::fs::create_dir_all(work_dir).await?;
    match tokio::fs::create_dir(&root).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return Err(ScanError::AlreadyProcessed(artifact.original_name.clone()));
        }
        Err(err) => return Err(err.into()),
    }

    let source = ExtractedSource {
        project: project.clone(),
        root: root.clone(),
    };

    info!(archive = %artifact.local_path.display(), target = %root.display(), "unzipping");
    let archive_path = artifact.local_path.clone();
    let name = artifact.original_name.clone();
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let mut task =
        tokio::task::spawn_blocking(move || unzip(&archive_path, &root, &name, &flag));

    let unpacked = match tokio::time::timeout(limit, &mut task).await {
        Ok(joined) => joined
            .map_err(|err| ScanError::Internal(format!("extraction task failed: {err}")))
            .and_then(|inner| inner),
        Err(_) => {
            cancel.store(true, Ordering::Relaxed);
            match task.await {
                Ok(Ok(())) | Ok(Err(ScanError::Cancelled(_))) => {}
                Ok(Err(err)) => debug!(error = %err, "extraction failed while stopping"),
                Err(err) => warn!(error = %err, "extraction task failed while stopping"),
            }
            Err(ScanError::Timeout {
                step: "extract",
                after: limit,
            })
        }
    };

    if let Err(err) = unpacked {
        source.remove().await;
        return Err(err);
    }

    info!(target = %source.root.display(), "extracted to directory");
    Ok(source)
}

/// Delete the downloaded archive once its contents are on disk.
pub async fn discard_archive(artifact: &RetrievedArtifact) {
    if let Err(err) = tokio::fs::remove_file(&artifact.local_path).await
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(
            path = %artifact.local_path.display(),
            error = %err,
            "failed to delete downloaded archive"
        );
    }
}

/// Entry-by-entry unpack that checks `cancel` between entries and between
/// chunks of a single entry.
fn unzip(archive_path: &Path, target: &Path, name: &str, cancel: &AtomicBool) -> Result<()> {
    let archive_error = |message: String| ScanError::Archive {
        artifact: name.to_string(),
        message,
    };

    let file = File::open(archive_path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|err| archive_error(err.to_string()))?;

    for index in 0..archive.len() {
        stop_if_cancelled(cancel, name)?;
        let mut entry = archive
            .by_index(index)
            .map_err(|err| archive_error(err.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(archive_error(format!(
                "entry `{}` escapes the extraction directory",
                entry.name()
            )));
        };
        let path = target.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&path)?;
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&path)?;
        copy_entry(&mut entry, &mut out, cancel, name)?;
    }
    Ok(())
}

fn copy_entry(
    reader: &mut impl Read,
    writer: &mut impl Write,
    cancel: &AtomicBool,
    name: &str,
) -> Result<()> {
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        stop_if_cancelled(cancel, name)?;
        let read = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(ScanError::Archive {
                    artifact: name.to_string(),
                    message: err.to_string(),
                });
            }
        };
        writer.write_all(&buf[..read])?;
    }
}

fn stop_if_cancelled(cancel: &AtomicBool, name: &str) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        return Err(ScanError::Cancelled(format!("extraction of {name}")));
    }
    Ok(())
}
