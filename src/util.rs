use std::fmt;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{stat_err, PatchError};

/// A path relative to a tree root, always stored with `/` separators.
///
/// This is the canonical key for every comparison and for the manifest, so
/// host-native and POSIX spellings of the same file never disagree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelPath(String);

impl RelPath {
    /// Normalize a host-native relative path. Rejects anything that is not a
    /// plain sequence of named components.
    pub fn from_path(relative: &Path) -> Result<Self, String> {
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => {
                    let name = name
                        .to_str()
                        .ok_or_else(|| format!("non-UTF8 path: {}", relative.display()))?;
                    parts.push(name);
                }
                Component::CurDir => {}
                _ => return Err(format!("not a relative path: {}", relative.display())),
            }
        }
        if parts.is_empty() {
            return Err("empty path".to_string());
        }
        Ok(Self(parts.join("/")))
    }

    /// Validate a `/`-separated key as found in a manifest.
    pub fn parse(key: &str) -> Result<Self, String> {
        let mut parts = Vec::new();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(format!("invalid path segment in {key:?}"));
            }
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => parts.push(segment),
                _ => return Err(format!("invalid path segment in {key:?}")),
            }
        }
        Ok(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The same path in host convention, rooted at `root`.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        let mut full = root.to_path_buf();
        full.extend(self.0.split('/'));
        full
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub relative_path: RelPath,
    pub kind: EntryKind,
    pub full_path: PathBuf,
    /// File size in bytes (0 for directories). Free from the OS directory scan.
    pub size: u64,
}

/// Lazily walk a directory tree, depth first, siblings in file-name order.
///
/// Symlinks are not followed and entries that are neither regular files nor
/// directories are skipped. Each call starts a fresh traversal.
pub fn walk_directory(root: &Path) -> impl Iterator<Item = Result<DirEntry, PatchError>> {
    let root = root.to_path_buf();
    WalkDir::new(&root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(root.as_path()).to_path_buf();
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                    return Some(Err(stat_err(path, source)));
                }
            };

            let kind = if entry.file_type().is_dir() {
                EntryKind::Dir
            } else if entry.file_type().is_file() {
                EntryKind::File
            } else {
                return None;
            };

            Some(to_dir_entry(&root, entry, kind))
        })
}

fn to_dir_entry(root: &Path, entry: walkdir::DirEntry, kind: EntryKind) -> Result<DirEntry, PatchError> {
    let full_path = entry.path().to_path_buf();
    let relative = full_path.strip_prefix(root).map_err(|_| {
        stat_err(
            &full_path,
            std::io::Error::other("entry outside of walked root"),
        )
    })?;
    let relative_path = RelPath::from_path(relative).map_err(|reason| {
        stat_err(
            &full_path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, reason),
        )
    })?;

    let size = match kind {
        EntryKind::File => entry
            .metadata()
            .map_err(|e| {
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("metadata unavailable"));
                stat_err(&full_path, source)
            })?
            .len(),
        EntryKind::Dir => 0,
    };

    Ok(DirEntry {
        relative_path,
        kind,
        full_path,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_rel_path_from_native() {
        let rel = RelPath::from_path(&Path::new("src").join("app.js")).unwrap();
        assert_eq!(rel.as_str(), "src/app.js");
        assert!(RelPath::from_path(Path::new("../escape")).is_err());
        assert!(RelPath::from_path(Path::new("")).is_err());
    }

    #[test]
    fn test_rel_path_parse_rejects_escapes() {
        assert_eq!(RelPath::parse("a/b/c.txt").unwrap().as_str(), "a/b/c.txt");
        assert!(RelPath::parse("../etc/passwd").is_err());
        assert!(RelPath::parse("/abs").is_err());
        assert!(RelPath::parse("a//b").is_err());
        assert!(RelPath::parse("a/./b").is_err());
        assert!(RelPath::parse("").is_err());
    }

    #[test]
    fn test_resolve_uses_host_separators() {
        let rel = RelPath::parse("old/unused.txt").unwrap();
        let root = Path::new("dest");
        assert_eq!(rel.resolve(root), root.join("old").join("unused.txt"));
    }

    #[test]
    fn test_walk_directory_depth_first_sorted() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("b/inner")).unwrap();
        fs::write(root.join("b/inner/z.txt"), b"zz").unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::write(root.join("c.txt"), b"ccc").unwrap();

        let entries: Vec<DirEntry> = walk_directory(root).collect::<Result<_, _>>().unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b", "b/inner", "b/inner/z.txt", "c.txt"]);

        let z = entries.iter().find(|e| e.relative_path.as_str() == "b/inner/z.txt").unwrap();
        assert_eq!(z.kind, EntryKind::File);
        assert_eq!(z.size, 2);
        assert_eq!(entries[1].kind, EntryKind::Dir);
    }

    #[test]
    fn test_walk_missing_root_reports_stat_error() {
        let temp = TempDir::new().unwrap();
        let mut walk = walk_directory(&temp.path().join("missing"));
        assert!(matches!(walk.next(), Some(Err(PatchError::Stat { .. }))));
    }
}
