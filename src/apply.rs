use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{write_err, PatchError};
use crate::patch_format::{Counter, Status, TaggedRecord, DEFAULT_HIGH_WATER_MARK};
use crate::pipeline::{self, Passthrough, RecordStream, Stage, StageTask};
use crate::read::{self, ReadOptions};
use crate::write::write_content;

const STAGE: &str = "apply";

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Re-emit every input record on the stage output.
    pub passthrough: bool,
    /// Log and count a failed file instead of aborting the whole stream.
    pub keep_going: bool,
    pub high_water_mark: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            passthrough: false,
            keep_going: false,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: Counter,
    /// Files skipped after an error (only with `keep_going`).
    pub failed: usize,
}

/// Apply a tagged record stream to `dest_root`.
///
/// Each file is handled on its own: DELETED removes the target if present,
/// NEW creates parent directories and writes, CHANGED overwrites in place.
/// A NEW file whose path is still occupied (a directory at the path, or a
/// file where a parent directory belongs) waits until the rest of the stream
/// has run, so the deletions that free its path go first; directories left
/// empty at its path are removed. A delete that meets a directory or a
/// missing parent is a no-op.
/// There is no rollback; files applied before a failure stay applied.
pub fn apply(
    input: RecordStream<TaggedRecord>,
    dest_root: &Path,
    options: ApplyOptions,
) -> Stage<TaggedRecord, ApplySummary> {
    let (passthrough, output) = Passthrough::new(options.passthrough, options.high_water_mark);
    let dest_root = dest_root.to_path_buf();

    let handle = tokio::spawn(async move {
        let mut applier = PatchApplier {
            dest_root,
            keep_going: options.keep_going,
            summary: ApplySummary::default(),
            passthrough,
        };
        match applier.run(input).await {
            Ok(()) => {
                tracing::info!("Patch successfully applied: {}", applier.summary.applied);
                Ok(applier.summary)
            }
            Err(e) => Err(applier.passthrough.fail(STAGE, e).await),
        }
    });

    Stage {
        output,
        task: StageTask::new(STAGE, handle),
    }
}

struct PatchApplier {
    dest_root: PathBuf,
    keep_going: bool,
    summary: ApplySummary,
    passthrough: Passthrough<TaggedRecord>,
}

impl PatchApplier {
    async fn run(&mut self, mut input: RecordStream<TaggedRecord>) -> Result<(), PatchError> {
        // NEW files sitting where the patch still has to delete something
        let mut deferred = Vec::new();
        while let Some(record) = input.recv().await {
            let record = record?;
            let target = record.path.resolve(&self.dest_root);
            if record.status == Status::New && is_blocked(&target, &self.dest_root).await {
                tracing::debug!(path = %record.path, "blocked by an existing entry, deferring");
                deferred.push(record);
                continue;
            }
            self.apply_one(record).await?;
        }
        for record in deferred {
            self.apply_one(record).await?;
        }
        Ok(())
    }

    async fn apply_one(&mut self, record: TaggedRecord) -> Result<(), PatchError> {
        match apply_record(&record, &self.dest_root).await {
            Ok(()) => {
                tracing::debug!(path = %record.path, status = %record.status, "applied");
                self.summary.applied.add(record.status);
            }
            Err(e) if self.keep_going => {
                tracing::warn!(path = %record.path, error = %e, "failed to apply file, continuing");
                self.summary.failed += 1;
            }
            Err(e) => return Err(e),
        }
        self.passthrough.emit(record).await;
        Ok(())
    }
}

async fn apply_record(record: &TaggedRecord, dest_root: &Path) -> Result<(), PatchError> {
    let target = record.path.resolve(dest_root);
    match record.status {
        Status::Deleted => match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => Ok(()),
            // a directory now stands where the file was
            Err(e) => match tokio::fs::symlink_metadata(&target).await {
                Ok(meta) if meta.is_dir() => Ok(()),
                _ => Err(write_err(&target, e)),
            },
        },
        Status::New => {
            if is_dir(&target).await {
                remove_empty_tree(&target).await?;
            }
            write_content(&record.path, &record.content, &target, true).await
        }
        Status::Changed => write_content(&record.path, &record.content, &target, false).await,
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// A NEW target is blocked while a directory occupies it or a non-directory
/// occupies one of its parents below `dest_root`.
async fn is_blocked(target: &Path, dest_root: &Path) -> bool {
    if let Ok(meta) = tokio::fs::metadata(target).await {
        return meta.is_dir();
    }
    for ancestor in target.ancestors().skip(1).take_while(|a| *a != dest_root) {
        if let Ok(meta) = tokio::fs::metadata(ancestor).await {
            return !meta.is_dir();
        }
    }
    false
}

/// Remove `dir` if it holds nothing but (possibly nested) empty directories.
async fn remove_empty_tree(dir: &Path) -> Result<(), PatchError> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), PatchError> {
        for entry in WalkDir::new(&dir).follow_links(false).contents_first(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(dir.as_path()).to_path_buf();
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                    return Err(write_err(path, source));
                }
            };
            if entry.file_type().is_dir() {
                std::fs::remove_dir(entry.path()).map_err(|e| write_err(entry.path(), e))?;
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| PatchError::Task {
        stage: STAGE,
        reason: e.to_string(),
    })?
}

/// Read the patch at `patch_dir` and apply it to `target_dir`.
pub async fn apply_patch(
    target_dir: &Path,
    patch_dir: &Path,
    options: ApplyOptions,
) -> Result<ApplySummary, PatchError> {
    let read_options = ReadOptions {
        high_water_mark: options.high_water_mark,
        ..ReadOptions::default()
    };
    let reading = read::read(patch_dir, target_dir, read_options).await?;
    let applying = apply(reading.output, target_dir, options);

    let applied = applying.finish().await;
    let reader = reading.task.finish().await;
    let (summary, _) = pipeline::settle(applied, reader)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_format::Content;
    use crate::util::RelPath;
    use std::fs;
    use tempfile::TempDir;

    fn tagged(path: &str, status: Status, content: Content) -> TaggedRecord {
        TaggedRecord {
            path: RelPath::parse(path).unwrap(),
            status,
            content,
        }
    }

    async fn run_apply(
        records: Vec<TaggedRecord>,
        dest: &Path,
        options: ApplyOptions,
    ) -> Result<ApplySummary, PatchError> {
        let (sink, stream) = pipeline::channel(records.len().max(1));
        for record in records {
            sink.send(Ok(record)).await.unwrap();
        }
        drop(sink);
        apply(stream, dest, options).finish().await
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), b"x").unwrap();
        let records = vec![tagged("a.txt", Status::Deleted, Content::Absent)];

        let first = run_apply(records.clone(), temp.path(), ApplyOptions::default()).await.unwrap();
        assert!(!temp.path().join("a.txt").exists());
        assert_eq!(first.applied.deleted, 1);

        let second = run_apply(records, temp.path(), ApplyOptions::default()).await.unwrap();
        assert_eq!(second.applied.deleted, 1);
        assert_eq!(second.failed, 0);
    }

    #[tokio::test]
    async fn test_new_creates_parents_and_changed_overwrites() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), b"x").unwrap();

        let summary = run_apply(
            vec![
                tagged("deep/er/new.txt", Status::New, Content::Buffer(b"new".to_vec())),
                tagged("a.txt", Status::Changed, Content::Buffer(b"y".to_vec())),
            ],
            temp.path(),
            ApplyOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(summary.applied, Counter { new: 1, changed: 1, deleted: 0 });
        assert_eq!(fs::read(temp.path().join("deep/er/new.txt")).unwrap(), b"new");
        assert_eq!(fs::read(temp.path().join("a.txt")).unwrap(), b"y");
    }

    #[tokio::test]
    async fn test_failure_aborts_but_keeps_earlier_files() {
        let temp = TempDir::new().unwrap();
        let records = vec![
            tagged("first.txt", Status::New, Content::Buffer(b"1".to_vec())),
            tagged("missing-dir/changed.txt", Status::Changed, Content::Buffer(b"2".to_vec())),
            tagged("last.txt", Status::New, Content::Buffer(b"3".to_vec())),
        ];

        let err = run_apply(records, temp.path(), ApplyOptions::default()).await.unwrap_err();
        assert!(matches!(err, PatchError::Write { .. }));
        assert!(temp.path().join("first.txt").exists());
        assert!(!temp.path().join("last.txt").exists());
    }

    #[tokio::test]
    async fn test_keep_going_isolates_failures() {
        let temp = TempDir::new().unwrap();
        let records = vec![
            tagged("missing-dir/changed.txt", Status::Changed, Content::Buffer(b"2".to_vec())),
            tagged("last.txt", Status::New, Content::Buffer(b"3".to_vec())),
        ];
        let options = ApplyOptions {
            keep_going: true,
            ..ApplyOptions::default()
        };

        let summary = run_apply(records, temp.path(), options).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.applied.new, 1);
        assert_eq!(fs::read(temp.path().join("last.txt")).unwrap(), b"3");
    }

    #[tokio::test]
    async fn test_new_under_deleted_file_waits_for_the_delete() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a"), b"file").unwrap();
        let records = vec![
            tagged("a/b", Status::New, Content::Buffer(b"nested".to_vec())),
            tagged("a", Status::Deleted, Content::Absent),
        ];

        for _ in 0..2 {
            let summary = run_apply(records.clone(), temp.path(), ApplyOptions::default()).await.unwrap();
            assert_eq!(summary.applied, Counter { new: 1, changed: 0, deleted: 1 });
            assert_eq!(fs::read(temp.path().join("a/b")).unwrap(), b"nested");
        }
    }

    #[tokio::test]
    async fn test_new_over_emptied_directory() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a/inner")).unwrap();
        fs::write(temp.path().join("a/inner/b"), b"old").unwrap();
        let records = vec![
            tagged("a", Status::New, Content::Buffer(b"flat".to_vec())),
            tagged("a/inner/b", Status::Deleted, Content::Absent),
        ];

        for _ in 0..2 {
            let summary = run_apply(records.clone(), temp.path(), ApplyOptions::default()).await.unwrap();
            assert_eq!(summary.failed, 0);
            assert_eq!(fs::read(temp.path().join("a")).unwrap(), b"flat");
        }
    }

    #[tokio::test]
    async fn test_new_over_populated_directory_fails() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a")).unwrap();
        fs::write(temp.path().join("a/keep"), b"still here").unwrap();
        let records = vec![tagged("a", Status::New, Content::Buffer(b"flat".to_vec()))];

        let err = run_apply(records, temp.path(), ApplyOptions::default()).await.unwrap_err();
        assert!(matches!(err, PatchError::Write { .. }));
        assert_eq!(fs::read(temp.path().join("a/keep")).unwrap(), b"still here");
    }

    #[tokio::test]
    async fn test_apply_patch_twice_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let patch_dir = temp.path().join("patch");
        let target = temp.path().join("target");
        fs::create_dir_all(patch_dir.join("sub")).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(patch_dir.join("sub/new.txt"), b"n").unwrap();
        fs::write(patch_dir.join("a.txt"), b"y").unwrap();
        fs::write(
            patch_dir.join(crate::patch_format::MANIFEST_FILE),
            "{\"sub/new.txt\": \"new\", \"a.txt\": \"changed\", \"gone.txt\": \"deleted\"}",
        )
        .unwrap();
        fs::write(target.join("a.txt"), b"x").unwrap();
        fs::write(target.join("gone.txt"), b"bye").unwrap();

        for _ in 0..2 {
            let summary = apply_patch(&target, &patch_dir, ApplyOptions::default()).await.unwrap();
            assert_eq!(summary.applied.to_string(), "1 changed, 1 deleted, 1 new");
            assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"y");
            assert_eq!(fs::read(target.join("sub/new.txt")).unwrap(), b"n");
            assert!(!target.join("gone.txt").exists());
        }
    }
}
