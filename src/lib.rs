//! Incremental file-tree patches.
//!
//! A patch is computed by diffing an incoming tree against a baseline
//! ([`diff`]), persisted as a directory holding a `patch.json` manifest plus
//! the bytes of every new or changed file ([`write`]), and later turned back
//! into a record stream ([`read`]) that is applied to a destination tree
//! ([`apply`]). Files are opaque blobs: equal or fully replaced.

pub mod apply;
pub mod create;
pub mod diff;
pub mod error;
pub mod hash;
pub mod patch_format;
pub mod pipeline;
pub mod read;
pub mod source;
pub mod util;
pub mod write;

pub use apply::{apply, apply_patch, ApplyOptions, ApplySummary};
pub use create::{create_patch, CreateOptions};
pub use diff::{diff, diff_with_hasher, DiffOptions};
pub use error::PatchError;
pub use hash::{hash, Blake3Hasher, ContentHasher, Digest};
pub use patch_format::{Content, Counter, FileRecord, Manifest, Status, TaggedRecord, MANIFEST_FILE};
pub use pipeline::{RecordStream, Stage};
pub use read::{read, read_manifest, ReadOptions};
pub use util::RelPath;
pub use write::{write, WriteOptions};
