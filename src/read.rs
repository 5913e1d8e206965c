//! Reconstruct a tagged record stream from a patch directory.

use std::path::{Path, PathBuf};

use crate::error::{manifest_err, PatchError};
use crate::patch_format::{Content, Counter, Manifest, TaggedRecord, DEFAULT_HIGH_WATER_MARK, MANIFEST_FILE};
use crate::pipeline::{self, Stage, StageTask};

const STAGE: &str = "read";

#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Directory NEW/CHANGED payloads are resolved against. Defaults to the
    /// patch directory itself.
    pub base: Option<PathBuf>,
    pub high_water_mark: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            base: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Load and validate the manifest of `patch_dir`.
pub async fn read_manifest(patch_dir: &Path) -> Result<Manifest, PatchError> {
    let manifest_path = patch_dir.join(MANIFEST_FILE);
    let bytes = tokio::fs::read(&manifest_path)
        .await
        .map_err(|e| manifest_err(&manifest_path, e.to_string()))?;
    Manifest::from_json(&bytes).map_err(|e| manifest_err(&manifest_path, e.to_string()))
}

/// Open a patch directory as a record stream.
///
/// NEW/CHANGED records point at their payload inside the patch; DELETED
/// records point at the file to remove under `dest_root`. The manifest and
/// every payload are checked before the first record is emitted, so a
/// corrupt or incomplete patch fails here rather than halfway through an
/// apply. Completes with the manifest counts.
pub async fn read(
    patch_dir: &Path,
    dest_root: &Path,
    options: ReadOptions,
) -> Result<Stage<TaggedRecord, Counter>, PatchError> {
    let manifest = read_manifest(patch_dir).await?;
    let base = options.base.unwrap_or_else(|| patch_dir.to_path_buf());

    let mut records = Vec::with_capacity(manifest.len());
    for (path, status) in manifest.iter() {
        let content = if status.has_payload() {
            let payload = path.resolve(&base);
            let is_file = tokio::fs::metadata(&payload)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false);
            if !is_file {
                return Err(manifest_err(
                    patch_dir.join(MANIFEST_FILE),
                    format!("missing payload for {status} entry {path}"),
                ));
            }
            Content::File(payload)
        } else {
            Content::File(path.resolve(dest_root))
        };
        records.push(TaggedRecord {
            path: path.clone(),
            status,
            content,
        });
    }

    let counter = manifest.counter();
    tracing::info!("Patched files: {counter}");

    let (sink, output) = pipeline::channel(options.high_water_mark);
    let handle = tokio::spawn(async move {
        for record in records {
            sink.send(Ok(record))
                .await
                .map_err(|_| PatchError::Aborted(STAGE))?;
        }
        Ok::<_, PatchError>(counter)
    });

    Ok(Stage {
        output,
        task: StageTask::new(STAGE, handle),
    })
}
