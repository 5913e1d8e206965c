use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::util::{EntryKind, RelPath};

/// Fixed name of the manifest at the root of every patch directory.
pub const MANIFEST_FILE: &str = "patch.json";

/// Default bounded-channel capacity between pipeline stages, in records.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    New,
    Changed,
    Deleted,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::New => "new",
            Status::Changed => "changed",
            Status::Deleted => "deleted",
        }
    }

    /// NEW and CHANGED entries carry a stored payload.
    pub fn has_payload(&self) -> bool {
        !matches!(self, Status::Deleted)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Where a record's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Bytes held in memory.
    Buffer(Vec<u8>),
    /// A file opened lazily when the bytes are needed.
    File(PathBuf),
    /// No content, e.g. a directory entry.
    Absent,
}

/// An untagged entry produced by a file source.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: RelPath,
    pub kind: EntryKind,
    pub size: u64,
    pub content: Content,
}

impl FileRecord {
    pub fn file(path: RelPath, size: u64, content: Content) -> Self {
        Self {
            path,
            kind: EntryKind::File,
            size,
            content,
        }
    }

    pub fn buffer(path: RelPath, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self::file(path, size, Content::Buffer(bytes))
    }

    pub fn dir(path: RelPath) -> Self {
        Self {
            path,
            kind: EntryKind::Dir,
            size: 0,
            content: Content::Absent,
        }
    }
}

/// A file reference annotated with its diff status.
///
/// For DELETED records the content only locates the file being removed; it
/// is never read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedRecord {
    pub path: RelPath,
    pub status: Status,
    pub content: Content,
}

/// Ordered path → status mapping persisted as `patch.json`.
///
/// Keys keep the order in which they were first inserted; re-inserting a
/// path replaces its status in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<(RelPath, Status)>,
    index: HashMap<RelPath, usize>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous status if the path was already present.
    pub fn insert(&mut self, path: RelPath, status: Status) -> Option<Status> {
        match self.index.get(&path) {
            Some(&i) => Some(std::mem::replace(&mut self.entries[i].1, status)),
            None => {
                self.index.insert(path.clone(), self.entries.len());
                self.entries.push((path, status));
                None
            }
        }
    }

    pub fn get(&self, path: &RelPath) -> Option<Status> {
        self.index.get(path).map(|&i| self.entries[i].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RelPath, Status)> {
        self.entries.iter().map(|(path, status)| (path, *status))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counter(&self) -> Counter {
        let mut counter = Counter::default();
        for (_, status) in self.iter() {
            counter.add(status);
        }
        counter
    }

    /// Tab-indented JSON, keys in insertion order.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        Ok(out)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

impl Serialize for Manifest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (path, status) in &self.entries {
            map.serialize_entry(path.as_str(), status)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(ManifestVisitor)
    }
}

struct ManifestVisitor;

impl<'de> Visitor<'de> for ManifestVisitor {
    type Value = Manifest;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of relative paths to \"new\", \"changed\" or \"deleted\"")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Manifest, A::Error> {
        let mut manifest = Manifest::new();
        while let Some((key, status)) = access.next_entry::<String, Status>()? {
            let path = RelPath::parse(&key).map_err(serde::de::Error::custom)?;
            if manifest.insert(path, status).is_some() {
                return Err(serde::de::Error::custom(format!("duplicate path {key:?}")));
            }
        }
        Ok(manifest)
    }
}

/// Per-status tally, for reporting only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    pub new: usize,
    pub changed: usize,
    pub deleted: usize,
}

impl Counter {
    pub fn add(&mut self, status: Status) {
        match status {
            Status::New => self.new += 1,
            Status::Changed => self.changed += 1,
            Status::Deleted => self.deleted += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.new + self.changed + self.deleted
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} changed, {} deleted, {} new",
            self.changed, self.deleted, self.new
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(s: &str) -> RelPath {
        RelPath::parse(s).unwrap()
    }

    #[test]
    fn test_manifest_json_layout() {
        let mut manifest = Manifest::new();
        manifest.insert(rel("src/app.js"), Status::Changed);
        manifest.insert(rel("assets/logo.png"), Status::New);
        manifest.insert(rel("old/unused.txt"), Status::Deleted);

        let json = String::from_utf8(manifest.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            "{\n\t\"src/app.js\": \"changed\",\n\t\"assets/logo.png\": \"new\",\n\t\"old/unused.txt\": \"deleted\"\n}"
        );

        let parsed = Manifest::from_json(json.as_bytes()).unwrap();
        let keys: Vec<&str> = parsed.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(keys, vec!["src/app.js", "assets/logo.png", "old/unused.txt"]);
        assert_eq!(parsed.get(&rel("old/unused.txt")), Some(Status::Deleted));
    }

    #[test]
    fn test_manifest_insert_replaces_in_place() {
        let mut manifest = Manifest::new();
        manifest.insert(rel("a.txt"), Status::New);
        manifest.insert(rel("b.txt"), Status::New);
        assert_eq!(manifest.insert(rel("a.txt"), Status::Changed), Some(Status::New));

        let entries: Vec<(&str, Status)> = manifest.iter().map(|(p, s)| (p.as_str(), s)).collect();
        assert_eq!(entries, vec![("a.txt", Status::Changed), ("b.txt", Status::New)]);
    }

    #[test]
    fn test_manifest_rejects_bad_input() {
        assert!(Manifest::from_json(b"{\"a.txt\": \"renamed\"}").is_err());
        assert!(Manifest::from_json(b"{\"../a.txt\": \"new\"}").is_err());
        assert!(Manifest::from_json(b"[\"a.txt\"]").is_err());
        assert!(Manifest::from_json(b"{\"a.txt\": \"new\", \"a.txt\": \"deleted\"}").is_err());
        assert!(Manifest::from_json(b"{\"a.txt\": ").is_err());
    }

    #[test]
    fn test_counter_display_and_recount() {
        let mut manifest = Manifest::new();
        manifest.insert(rel("a"), Status::New);
        manifest.insert(rel("b"), Status::Changed);
        manifest.insert(rel("c"), Status::Changed);
        manifest.insert(rel("d"), Status::Deleted);

        let counter = manifest.counter();
        assert_eq!(counter.total(), 4);
        assert_eq!(counter.to_string(), "2 changed, 1 deleted, 1 new");
    }
}
