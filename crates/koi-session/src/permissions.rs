// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

/// Grant level for a directory.  The two levels are independent: a read
/// grant never implies write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessLevel {
    Read,
    Write,
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Per-directory read/write grant set.  Grants are monotone for the life of
/// the process: once a directory is allowed at a level, every path under it
/// stays allowed at that level.
#[derive(Debug, Default)]
pub struct FilePermissions {
    read_dirs: BTreeSet<PathBuf>,
    write_dirs: BTreeSet<PathBuf>,
}

impl FilePermissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `level` access to `dir` and everything beneath it.
    pub fn allow(&mut self, dir: impl AsRef<Path>, level: AccessLevel) {
        let canonical = canonicalize_lossy(dir.as_ref());
        debug!(dir = %canonical.display(), %level, "permission granted");
        self.set_for(level).insert(canonical);
    }

    /// A path is allowed iff some grant is an ancestor of (or equal to)
    /// either the path itself or its parent directory.
    pub fn is_allowed(&self, path: impl AsRef<Path>, level: AccessLevel) -> bool {
        let target = canonicalize_lossy(path.as_ref());
        let grants = match level {
            AccessLevel::Read => &self.read_dirs,
            AccessLevel::Write => &self.write_dirs,
        };
        let covers = |candidate: &Path| grants.iter().any(|g| candidate.starts_with(g));
        if covers(&target) {
            return true;
        }
        target.parent().map(covers).unwrap_or(false)
    }

    pub fn grants(&self, level: AccessLevel) -> Vec<PathBuf> {
        match level {
            AccessLevel::Read => self.read_dirs.iter().cloned().collect(),
            AccessLevel::Write => self.write_dirs.iter().cloned().collect(),
        }
    }

    fn set_for(&mut self, level: AccessLevel) -> &mut BTreeSet<PathBuf> {
        match level {
            AccessLevel::Read => &mut self.read_dirs,
            AccessLevel::Write => &mut self.write_dirs,
        }
    }
}

/// Best-effort canonicalisation: resolve symlinks when the path exists,
/// otherwise normalise lexically (absolute, no `.` / `..` components) so
/// grants for not-yet-created directories still match later.
fn canonicalize_lossy(path: &Path) -> PathBuf {
    if let Ok(real) = std::fs::canonicalize(path) {
        return real;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_denies_everything() {
        let p = FilePermissions::new();
        assert!(!p.is_allowed("/tmp/anything", AccessLevel::Read));
        assert!(!p.is_allowed("/tmp/anything", AccessLevel::Write));
    }

    #[test]
    fn grant_covers_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = FilePermissions::new();
        p.allow(dir.path(), AccessLevel::Read);
        assert!(p.is_allowed(dir.path().join("sub/deep/file.txt"), AccessLevel::Read));
    }

    #[test]
    fn grant_covers_the_directory_itself() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = FilePermissions::new();
        p.allow(dir.path(), AccessLevel::Write);
        assert!(p.is_allowed(dir.path(), AccessLevel::Write));
    }

    #[test]
    fn read_does_not_imply_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = FilePermissions::new();
        p.allow(dir.path(), AccessLevel::Read);
        assert!(!p.is_allowed(dir.path().join("f"), AccessLevel::Write));
    }

    #[test]
    fn write_does_not_imply_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = FilePermissions::new();
        p.allow(dir.path(), AccessLevel::Write);
        assert!(!p.is_allowed(dir.path().join("f"), AccessLevel::Read));
    }

    #[test]
    fn sibling_directories_are_not_covered() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        let mut p = FilePermissions::new();
        p.allow(&a, AccessLevel::Read);
        assert!(!p.is_allowed(b.join("file"), AccessLevel::Read));
    }

    #[test]
    fn prefix_of_name_is_not_an_ancestor() {
        // /tmp/x/ab must not be covered by a grant on /tmp/x/a.
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let ab = dir.path().join("ab");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&ab).unwrap();
        let mut p = FilePermissions::new();
        p.allow(&a, AccessLevel::Read);
        assert!(!p.is_allowed(ab.join("file"), AccessLevel::Read));
    }

    #[test]
    fn grants_are_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = FilePermissions::new();
        p.allow(dir.path(), AccessLevel::Read);
        p.allow(dir.path().join("other"), AccessLevel::Write);
        // The earlier read grant still holds after unrelated mutations.
        assert!(p.is_allowed(dir.path().join("x"), AccessLevel::Read));
    }

    #[test]
    fn relative_paths_are_normalised() {
        let mut p = FilePermissions::new();
        let cwd = std::env::current_dir().unwrap();
        p.allow(".", AccessLevel::Read);
        assert!(p.is_allowed(cwd.join("some-file"), AccessLevel::Read));
    }

    #[test]
    fn nonexistent_paths_still_match_lexically() {
        let mut p = FilePermissions::new();
        p.allow("/tmp/koi-perm-test-nonexistent", AccessLevel::Write);
        assert!(p.is_allowed("/tmp/koi-perm-test-nonexistent/new.txt", AccessLevel::Write));
    }

    #[test]
    fn dotdot_components_are_resolved() {
        let mut p = FilePermissions::new();
        p.allow("/tmp/koi-a/../koi-b", AccessLevel::Read);
        assert!(p.is_allowed("/tmp/koi-b/file", AccessLevel::Read));
        assert!(!p.is_allowed("/tmp/koi-a/file", AccessLevel::Read));
    }
}
