//! Persist a tagged record stream as a patch directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{write_err, PatchError};
use crate::patch_format::{Content, Counter, Manifest, TaggedRecord, DEFAULT_HIGH_WATER_MARK, MANIFEST_FILE};
use crate::pipeline::{Passthrough, RecordStream, Stage, StageTask};
use crate::util::RelPath;

const STAGE: &str = "write";

#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Re-emit every input record on the stage output.
    pub passthrough: bool,
    pub high_water_mark: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            passthrough: false,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Write a patch set into `patch_dir`.
///
/// Whatever was at `patch_dir` is removed first. NEW/CHANGED payloads are
/// copied as they arrive; the manifest is written last, so an aborted write
/// never leaves a readable patch behind. Completes with the manifest counts.
pub fn write(
    input: RecordStream<TaggedRecord>,
    patch_dir: &Path,
    options: WriteOptions,
) -> Stage<TaggedRecord, Counter> {
    let (passthrough, output) = Passthrough::new(options.passthrough, options.high_water_mark);
    let patch_dir = patch_dir.to_path_buf();

    let handle = tokio::spawn(async move {
        let mut writer = PatchWriter {
            patch_dir,
            manifest: Manifest::new(),
            passthrough,
        };
        match writer.run(input).await {
            Ok(counter) => Ok(counter),
            Err(e) => Err(writer.passthrough.fail(STAGE, e).await),
        }
    });

    Stage {
        output,
        task: StageTask::new(STAGE, handle),
    }
}

struct PatchWriter {
    patch_dir: PathBuf,
    manifest: Manifest,
    passthrough: Passthrough<TaggedRecord>,
}

impl PatchWriter {
    async fn run(&mut self, mut input: RecordStream<TaggedRecord>) -> Result<Counter, PatchError> {
        reset_dir(&self.patch_dir).await?;

        while let Some(record) = input.recv().await {
            let record = record?;
            if record.status.has_payload() {
                if record.path.as_str() == MANIFEST_FILE {
                    return Err(write_err(
                        record.path.resolve(&self.patch_dir),
                        std::io::Error::new(
                            ErrorKind::InvalidInput,
                            "path collides with the patch manifest",
                        ),
                    ));
                }
                let target = record.path.resolve(&self.patch_dir);
                write_content(&record.path, &record.content, &target, true).await?;
            }

            if let Some(previous) = self.manifest.insert(record.path.clone(), record.status) {
                tracing::warn!(path = %record.path, %previous, status = %record.status, "path listed twice, keeping last status");
                if previous.has_payload() && !record.status.has_payload() {
                    remove_payload(&record.path.resolve(&self.patch_dir)).await?;
                }
            }
            tracing::debug!(path = %record.path, status = %record.status, "recorded");
            self.passthrough.emit(record).await;
        }

        let manifest_path = self.patch_dir.join(MANIFEST_FILE);
        let json = self
            .manifest
            .to_json()
            .map_err(|e| write_err(&manifest_path, std::io::Error::other(e)))?;
        tokio::fs::write(&manifest_path, json)
            .await
            .map_err(|e| write_err(&manifest_path, e))?;

        let counter = self.manifest.counter();
        tracing::info!("Patch successfully created: {counter}");
        Ok(counter)
    }
}

/// Remove `dir` and everything in it, then recreate it empty.
async fn reset_dir(dir: &Path) -> Result<(), PatchError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(write_err(dir, e)),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| write_err(dir, e))
}

/// Drop a payload written for an entry that ended up DELETED.
async fn remove_payload(payload: &Path) -> Result<(), PatchError> {
    match tokio::fs::remove_file(payload).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(write_err(payload, e)),
    }
}

/// Copy a record's bytes to `target`, optionally creating its parent first.
pub(crate) async fn write_content(
    path: &RelPath,
    content: &Content,
    target: &Path,
    create_parents: bool,
) -> Result<(), PatchError> {
    if create_parents {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_err(parent, e))?;
        }
    }

    match content {
        Content::Buffer(bytes) => tokio::fs::write(target, bytes)
            .await
            .map_err(|e| write_err(target, e)),
        Content::File(source) => tokio::fs::copy(source, target)
            .await
            .map(|_| ())
            .map_err(|e| write_err(target, e)),
        Content::Absent => Err(PatchError::InvalidInputKind(path.to_string())),
    }
}
