//! Reference file source: streams the entries of an incoming directory.

use std::path::Path;

use crate::error::PatchError;
use crate::patch_format::{Content, FileRecord};
use crate::pipeline::{self, forward_failure_blocking, Stage, StageTask};
use crate::util::{self, EntryKind};

const STAGE: &str = "source";

/// Walk `root` on a blocking thread and stream one [`FileRecord`] per entry,
/// directories included, in depth-first file-name order. The walk stops as
/// soon as the consumer hangs up. Completes with the number of records sent.
pub fn scan(root: &Path, high_water_mark: usize) -> Stage<FileRecord, usize> {
    let (sink, output) = pipeline::channel(high_water_mark);
    let root = root.to_path_buf();

    let handle = tokio::task::spawn_blocking(move || -> Result<usize, PatchError> {
        let mut sent = 0;
        for entry in util::walk_directory(&root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Err(forward_failure_blocking(&sink, STAGE, e)),
            };

            let record = match entry.kind {
                EntryKind::File => FileRecord::file(
                    entry.relative_path,
                    entry.size,
                    Content::File(entry.full_path),
                ),
                EntryKind::Dir => FileRecord::dir(entry.relative_path),
            };

            if sink.blocking_send(Ok(record)).is_err() {
                return Err(PatchError::Aborted(STAGE));
            }
            sent += 1;
        }
        tracing::debug!(root = %root.display(), sent, "source scan finished");
        Ok(sent)
    });

    Stage {
        output,
        task: StageTask::new(STAGE, handle),
    }
}
