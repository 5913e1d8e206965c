use std::path::Path;

use crate::diff::{self, DiffOptions};
use crate::error::PatchError;
use crate::patch_format::{Counter, DEFAULT_HIGH_WATER_MARK};
use crate::pipeline;
use crate::source;
use crate::write::{self, WriteOptions};

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub high_water_mark: usize,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Create a patch directory by comparing `new_dir` against `old_dir`.
///
/// Scans `new_dir`, diffs every file against `old_dir` and writes the result
/// into `output`, replacing whatever was there. If any stage fails the
/// manifest is never written.
pub async fn create_patch(
    old_dir: &Path,
    new_dir: &Path,
    output: &Path,
    options: CreateOptions,
) -> Result<Counter, PatchError> {
    let hwm = options.high_water_mark;

    let scanning = source::scan(new_dir, hwm);
    let diffing = diff::diff(
        scanning.output,
        old_dir,
        DiffOptions {
            high_water_mark: hwm,
        },
    );
    let writing = write::write(
        diffing.output,
        output,
        WriteOptions {
            passthrough: false,
            high_water_mark: hwm,
        },
    );

    let written = writing.finish().await;
    let diffed = diffing.task.finish().await;
    let scanned = scanning.task.finish().await;

    let (counter, _) = pipeline::settle(written, pipeline::settle(diffed, scanned))?;
    Ok(counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_format::{Manifest, Status, MANIFEST_FILE};
    use crate::util::RelPath;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_patch_from_empty_baseline() {
        let temp = TempDir::new().unwrap();
        let old_dir = temp.path().join("old");
        let new_dir = temp.path().join("new");
        let patch_dir = temp.path().join("patch");
        fs::create_dir_all(&old_dir).unwrap();
        fs::create_dir_all(&new_dir).unwrap();
        fs::write(new_dir.join("a.txt"), b"x").unwrap();

        let counter = create_patch(&old_dir, &new_dir, &patch_dir, CreateOptions::default())
            .await
            .unwrap();

        assert_eq!(counter, Counter { new: 1, changed: 0, deleted: 0 });
        assert_eq!(fs::read(patch_dir.join("a.txt")).unwrap(), b"x");
        assert_eq!(
            fs::read_to_string(patch_dir.join(MANIFEST_FILE)).unwrap(),
            "{\n\t\"a.txt\": \"new\"\n}"
        );
    }

    #[tokio::test]
    async fn test_create_patch_is_a_full_overwrite() {
        let temp = TempDir::new().unwrap();
        let old_dir = temp.path().join("old");
        let new_dir = temp.path().join("new");
        let patch_dir = temp.path().join("patch");
        fs::create_dir_all(&old_dir).unwrap();
        fs::create_dir_all(&new_dir).unwrap();
        fs::write(old_dir.join("a.txt"), b"x").unwrap();
        fs::write(new_dir.join("b.txt"), b"b").unwrap();

        create_patch(&old_dir, &new_dir, &patch_dir, CreateOptions::default())
            .await
            .unwrap();
        fs::write(new_dir.join("a.txt"), b"x").unwrap();
        fs::remove_file(new_dir.join("b.txt")).unwrap();
        let counter = create_patch(&old_dir, &new_dir, &patch_dir, CreateOptions::default())
            .await
            .unwrap();

        assert_eq!(counter.total(), 0);
        assert!(!patch_dir.join("b.txt").exists());
        let manifest = Manifest::from_json(&fs::read(patch_dir.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert!(manifest.is_empty());
        assert_eq!(manifest.get(&RelPath::parse("a.txt").unwrap()), None::<Status>);
    }

    #[tokio::test]
    async fn test_missing_incoming_dir_fails_without_manifest() {
        let temp = TempDir::new().unwrap();
        let patch_dir = temp.path().join("patch");

        let err = create_patch(
            temp.path(),
            &temp.path().join("missing"),
            &patch_dir,
            CreateOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PatchError::Stat { .. }));
        assert!(!patch_dir.join(MANIFEST_FILE).exists());
    }
}
