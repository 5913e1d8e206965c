//! Classify an incoming record stream against a baseline directory.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{stat_err, PatchError};
use crate::hash::{Blake3Hasher, ContentHasher};
use crate::patch_format::{Content, Counter, FileRecord, Status, TaggedRecord, DEFAULT_HIGH_WATER_MARK};
use crate::pipeline::{self, forward_failure, forward_failure_blocking, RecordSink, RecordStream, Stage, StageTask};
use crate::util::{self, EntryKind, RelPath};

const STAGE: &str = "diff";

#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Capacity of the output stream (and of the baseline walk feeding it).
    pub high_water_mark: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Bookkeeping for a single diff run: which baseline files matched an
/// incoming file, and how many records of each status were emitted.
#[derive(Debug, Default)]
struct DiffState {
    accounted: HashSet<RelPath>,
    counter: Counter,
}

impl DiffState {
    fn is_accounted(&self, path: &RelPath) -> bool {
        self.accounted.contains(path)
    }
}

/// Diff `incoming` against `baseline` with the default BLAKE3 hasher.
///
/// NEW/CHANGED records follow the incoming order; DELETED records come after,
/// in baseline walk order. Unchanged files produce nothing. Completes with
/// the per-status counts.
pub fn diff(
    incoming: RecordStream<FileRecord>,
    baseline: &Path,
    options: DiffOptions,
) -> Stage<TaggedRecord, Counter> {
    diff_with_hasher(incoming, baseline, options, Arc::new(Blake3Hasher))
}

pub fn diff_with_hasher(
    incoming: RecordStream<FileRecord>,
    baseline: &Path,
    options: DiffOptions,
    hasher: Arc<dyn ContentHasher>,
) -> Stage<TaggedRecord, Counter> {
    let (sink, output) = pipeline::channel(options.high_water_mark);
    let baseline = baseline.to_path_buf();

    let handle = tokio::spawn(async move {
        let mut differ = TreeDiffer {
            baseline,
            hasher,
            sink,
            state: DiffState::default(),
            high_water_mark: options.high_water_mark,
        };
        match differ.run(incoming).await {
            Ok(()) => {
                tracing::info!("Patched files: {}", differ.state.counter);
                Ok(differ.state.counter)
            }
            Err(e) if e.is_aborted() => Err(e),
            Err(e) => Err(forward_failure(Some(&differ.sink), STAGE, e).await),
        }
    });

    Stage {
        output,
        task: StageTask::new(STAGE, handle),
    }
}

struct TreeDiffer {
    baseline: PathBuf,
    hasher: Arc<dyn ContentHasher>,
    sink: RecordSink<TaggedRecord>,
    state: DiffState,
    high_water_mark: usize,
}

impl TreeDiffer {
    async fn run(&mut self, mut incoming: RecordStream<FileRecord>) -> Result<(), PatchError> {
        while let Some(record) = incoming.recv().await {
            let record = record?;
            if record.kind == EntryKind::Dir {
                continue;
            }
            if let Some(status) = self.classify(&record).await? {
                tracing::debug!(path = %record.path, %status, "classified");
                self.emit(TaggedRecord {
                    path: record.path,
                    status,
                    content: record.content,
                })
                .await?;
            }
        }

        let mut walk = walk_baseline(&self.baseline, self.high_water_mark).await?;
        while let Some(entry) = walk.recv().await {
            let (path, full_path) = entry?;
            if self.state.is_accounted(&path) {
                continue;
            }
            tracing::debug!(%path, "classified deleted");
            self.emit(TaggedRecord {
                path,
                status: Status::Deleted,
                content: Content::File(full_path),
            })
            .await?;
        }
        Ok(())
    }

    async fn classify(&mut self, record: &FileRecord) -> Result<Option<Status>, PatchError> {
        let baseline_path = record.path.resolve(&self.baseline);
        let meta = match tokio::fs::metadata(&baseline_path).await {
            Ok(meta) => meta,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                return Ok(Some(Status::New));
            }
            Err(e) => return Err(stat_err(&baseline_path, e)),
        };
        if !meta.is_file() {
            return Ok(Some(Status::New));
        }

        self.state.accounted.insert(record.path.clone());

        if meta.len() != record.size {
            return Ok(Some(Status::Changed));
        }

        let baseline_content = Content::File(baseline_path);
        let (old_hash, new_hash) = tokio::try_join!(
            self.hasher.hash(&baseline_content),
            self.hasher.hash(&record.content),
        )?;
        Ok((old_hash != new_hash).then_some(Status::Changed))
    }

    async fn emit(&mut self, record: TaggedRecord) -> Result<(), PatchError> {
        let status = record.status;
        self.sink
            .send(Ok(record))
            .await
            .map_err(|_| PatchError::Aborted(STAGE))?;
        self.state.counter.add(status);
        Ok(())
    }
}

/// Stream every regular file under `baseline` from a blocking thread. A
/// baseline that does not exist yet is an empty tree.
async fn walk_baseline(
    baseline: &Path,
    high_water_mark: usize,
) -> Result<RecordStream<(RelPath, PathBuf)>, PatchError> {
    let (sink, stream) = pipeline::channel(high_water_mark);
    match tokio::fs::metadata(baseline).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(stream),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(stream),
        Err(e) => return Err(stat_err(baseline, e)),
    }

    let baseline = baseline.to_path_buf();
    tokio::task::spawn_blocking(move || {
        for entry in util::walk_directory(&baseline) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    forward_failure_blocking(&sink, "baseline walk", e);
                    return;
                }
            };
            if entry.kind != EntryKind::File {
                continue;
            }
            if sink
                .blocking_send(Ok((entry.relative_path, entry.full_path)))
                .is_err()
            {
                return;
            }
        }
    });
    Ok(stream)
}
