//! Lexical path normalization.
//!
//! Rule targets, sources, and task names are compared as strings after
//! anchoring, so every path entering the graph goes through the same
//! cleanup. Purely lexical; the filesystem is never consulted.

use std::path::{Component, Path, PathBuf};

/// Normalize a path lexically: drop `.` components and resolve `..` against
/// preceding normal components. An empty result becomes `.`.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let ends_with_normal =
                    matches!(out.components().next_back(), Some(Component::Normal(_)));
                if ends_with_normal {
                    let _ = out.pop();
                } else {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Anchor `path` to a script directory: absolute paths pass through cleaned,
/// relative paths are joined onto the directory first.
pub fn anchor(directory: &Path, path: impl AsRef<Path>) -> PathBuf {
    clean(&directory.join(path.as_ref()))
}

/// Does the string contain a path separator?
pub fn has_separator(name: &str) -> bool {
    name.contains('/') || name.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_drops_curdir() {
        assert_eq!(clean(Path::new("./foo.o")), PathBuf::from("foo.o"));
        assert_eq!(clean(Path::new("./sub/./foo.o")), PathBuf::from("sub/foo.o"));
    }

    #[test]
    fn test_clean_resolves_parent() {
        assert_eq!(clean(Path::new("sub/../foo.o")), PathBuf::from("foo.o"));
        assert_eq!(clean(Path::new("../foo.o")), PathBuf::from("../foo.o"));
    }

    #[test]
    fn test_clean_empty_is_dot() {
        assert_eq!(clean(Path::new(".")), PathBuf::from("."));
        assert_eq!(clean(Path::new("")), PathBuf::from("."));
    }

    #[test]
    fn test_anchor() {
        assert_eq!(
            anchor(Path::new("."), "foo.o"),
            PathBuf::from("foo.o")
        );
        assert_eq!(
            anchor(Path::new("sub"), "foo.o"),
            PathBuf::from("sub/foo.o")
        );
        assert_eq!(
            anchor(Path::new("sub"), "/abs/foo.o"),
            PathBuf::from("/abs/foo.o")
        );
    }

    #[test]
    fn test_has_separator() {
        assert!(has_separator("a/b"));
        assert!(has_separator("a\\b"));
        assert!(!has_separator("Exmakefile"));
    }
}
