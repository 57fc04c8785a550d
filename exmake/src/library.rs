//! Reusable script library metadata.
//!
//! Libraries are loaded by scripts through `load_lib`/`load_lib_qual`. Each
//! carries descriptive metadata, a list of precious OS environment variables
//! the build must snapshot, and an optional `on_load` hook executed at most
//! once per build, only when the environment cache is stale.

use crate::script::RecipeRef;

/// Metadata a library declares about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryMetadata {
    /// Library identifier.
    pub name: String,

    /// One-line description.
    pub description: String,

    /// License name.
    pub license: String,

    /// Semantic version triple.
    pub version: (u64, u64, u64),

    /// Project URL.
    pub url: String,

    /// Author string.
    pub author: String,

    /// OS environment variables to persist in the configuration snapshot.
    pub precious: Vec<String>,

    /// Hook invoked once per build with `(args, tail_args)`.
    pub on_load: Option<RecipeRef>,
}

impl LibraryMetadata {
    /// Minimal metadata with just a name; the rest defaults to empty.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            license: String::new(),
            version: (0, 0, 0),
            url: String::new(),
            author: String::new(),
            precious: Vec::new(),
            on_load: None,
        }
    }

    /// `major.minor.patch` rendering of the version triple.
    pub fn version_string(&self) -> String {
        let (major, minor, patch) = self.version;
        format!("{major}.{minor}.{patch}")
    }
}
