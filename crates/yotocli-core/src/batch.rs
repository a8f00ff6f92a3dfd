//! Batch ingestion with bounded concurrency.
//!
//! A fixed number of workers pull files from a shared cursor and run the
//! upload pipeline on each. Every result is written into the slot of the
//! file's input index, so the output order never depends on which upload
//! finishes first. The first failure stops dispatching; work already in
//! flight is allowed to finish and then discarded.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::upload::{IngestedTrack, PipelineStage, ProgressFn, UploadPipeline};

/// Number of files ingested at the same time.
pub const BATCH_CONCURRENCY: usize = 5;

/// File extensions picked up from a directory, lowercase.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "wav"];

/// Whether `path` has one of the [`AUDIO_EXTENSIONS`], ignoring case.
#[must_use]
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Audio files directly inside `dir`, sorted by path.
pub fn collect_audio_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::FileSystem {
            path: dir.to_path_buf(),
            message: "not a directory".to_string(),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| Error::FileSystem {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        if entry.file_type().is_file() && is_audio_file(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort();

    debug!(dir = %dir.display(), count = files.len(), "Collected audio files");
    Ok(files)
}

/// Shared state of one batch run.
struct BatchRun<'a> {
    paths: &'a [PathBuf],
    normalize: bool,
    progress: Option<&'a ProgressFn>,
    cursor: AtomicUsize,
    slots: Vec<OnceLock<IngestedTrack>>,
    first_error: Mutex<Option<Error>>,
    stop: CancellationToken,
}

impl BatchRun<'_> {
    fn fail(&self, err: Error) {
        let mut first = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
        if first.is_none() {
            *first = Some(err);
        }
        self.stop.cancel();
    }
}

/// Runs the upload pipeline over many files with a fixed worker pool.
#[derive(Debug, Clone)]
pub struct BatchIngestor {
    pipeline: UploadPipeline,
    workers: usize,
}

impl BatchIngestor {
    /// Ingestor with [`BATCH_CONCURRENCY`] workers.
    #[must_use]
    pub const fn new(pipeline: UploadPipeline) -> Self {
        Self {
            pipeline,
            workers: BATCH_CONCURRENCY,
        }
    }

    /// Use a different worker count (at least one).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Ingest `paths`, returning one track per path in input order.
    ///
    /// Fails as a whole on the first error.
    pub async fn ingest(
        &self,
        paths: &[PathBuf],
        normalize: bool,
        progress: Option<&ProgressFn>,
    ) -> Result<Vec<IngestedTrack>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let run = BatchRun {
            paths,
            normalize,
            progress,
            cursor: AtomicUsize::new(0),
            slots: paths.iter().map(|_| OnceLock::new()).collect(),
            first_error: Mutex::new(None),
            stop: CancellationToken::new(),
        };

        let workers = self.workers.min(paths.len());
        info!(files = paths.len(), workers, "Starting batch ingestion");

        join_all((0..workers).map(|worker| self.run_worker(worker, &run))).await;

        let BatchRun {
            slots, first_error, ..
        } = run;

        if let Some(err) = first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
            error!(error = %err, "Batch ingestion failed");
            return Err(err);
        }

        let tracks = slots
            .into_iter()
            .zip(paths)
            .map(|(slot, path)| {
                slot.into_inner().ok_or_else(|| Error::Pipeline {
                    stage: PipelineStage::Complete,
                    message: format!("no result recorded for {}", path.display()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(files = tracks.len(), "Batch ingestion complete");
        Ok(tracks)
    }

    async fn run_worker(&self, worker: usize, run: &BatchRun<'_>) {
        loop {
            if run.stop.is_cancelled() {
                debug!(worker, "Worker stopping after batch failure");
                break;
            }

            let index = run.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(path) = run.paths.get(index) else {
                break;
            };

            debug!(worker, index, path = %path.display(), "Worker picked file");
            match self.pipeline.ingest(path, run.normalize, run.progress).await {
                Ok(track) => {
                    if run.stop.is_cancelled() {
                        debug!(worker, index, "Discarding result of cancelled batch");
                    }
                    let _ = run.slots[index].set(track);
                }
                Err(err) => {
                    error!(worker, index, path = %path.display(), error = %err, "Ingestion failed");
                    run.fail(err);
                    break;
                }
            }
        }
    }
}
