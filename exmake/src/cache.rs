//! On-disk cache of the dependency graph, environment table, compiled script
//! artifacts, fallbacks, and configuration snapshot.
//!
//! Everything lives under one cache directory (default `.exmake`). The graph
//! is persisted through its public accessors as three tables — vertices,
//! edges, and the derived out-neighbor index — so the graph type itself stays
//! opaque to this layer. `manifest.lst` holds the set of files whose
//! modification invalidates the whole cache.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use exmake_graph::{Graph, NodeId};
use filetime::FileTime;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::env::{self, EnvTable};
use crate::error::{Error, Result};
use crate::script::{Fallback, WorkUnit};

/// Default cache directory name, relative to the working directory.
pub const DEFAULT_DIR: &str = ".exmake";

/// Suffix given to persisted compiled script artifacts.
pub const ARTIFACT_SUFFIX: &str = "mod";

const VERTICES_FILE: &str = "vertices.dag";
const EDGES_FILE: &str = "edges.dag";
const NEIGHBORS_FILE: &str = "neighbors.dag";
const TABLE_FILE: &str = "table.env";
const MANIFEST_FILE: &str = "manifest.lst";
const CONFIG_ENV_FILE: &str = "config.env";
const CONFIG_ARG_FILE: &str = "config.arg";
const FALLBACKS_FILE: &str = "fallbacks.lst";

/// Modification time of a file; missing files read as the epoch.
pub fn mtime(path: &Path) -> FileTime {
    match fs::metadata(path) {
        Ok(meta) => FileTime::from_last_modification_time(&meta),
        Err(_) => FileTime::zero(),
    }
}

/// Handle on one cache directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Cache store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache store at the default location under the working directory.
    pub fn default_location() -> Self {
        Self::new(DEFAULT_DIR)
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Cache(format!("could not create '{}': {e}", self.dir.display())))
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.ensure_dir()?;
        let path = self.file(name);
        let data = serde_json::to_vec(value)
            .map_err(|e| Error::Cache(format!("could not encode '{}': {e}", path.display())))?;
        fs::write(&path, data)
            .map_err(|e| Error::Cache(format!("could not write '{}': {e}", path.display())))
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.file(name);
        let data = fs::read(&path)
            .map_err(|e| Error::Cache(format!("could not read '{}': {e}", path.display())))?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Cache(format!("could not decode '{}': {e}", path.display())))
    }

    /// Persist the dependency graph.
    pub fn save_graph(&self, graph: &Graph<WorkUnit>) -> Result<()> {
        let ids = graph.node_ids();

        let mut vertices: Vec<(u64, WorkUnit)> = Vec::with_capacity(ids.len());
        let mut edges: Vec<(u64, u64)> = Vec::new();
        let mut neighbors: Vec<(u64, Vec<u64>)> = Vec::with_capacity(ids.len());

        for &id in &ids {
            let unit = graph
                .node(id)
                .map_err(|e| Error::Cache(format!("graph snapshot failed: {e}")))?;
            vertices.push((id.0 as u64, unit.clone()));

            let outs = graph
                .out_neighbors(id)
                .map_err(|e| Error::Cache(format!("graph snapshot failed: {e}")))?;
            let outs: Vec<u64> = outs.into_iter().map(|n| n.0 as u64).collect();
            for &to in &outs {
                edges.push((id.0 as u64, to));
            }
            neighbors.push((id.0 as u64, outs));
        }

        self.write_json(VERTICES_FILE, &vertices)?;
        self.write_json(EDGES_FILE, &edges)?;
        self.write_json(NEIGHBORS_FILE, &neighbors)
    }

    /// Restore the dependency graph saved by [`CacheStore::save_graph`].
    pub fn load_graph(&self) -> Result<Graph<WorkUnit>> {
        let vertices: Vec<(u64, WorkUnit)> = self.read_json(VERTICES_FILE)?;
        let edges: Vec<(u64, u64)> = self.read_json(EDGES_FILE)?;
        let neighbors: Vec<(u64, Vec<u64>)> = self.read_json(NEIGHBORS_FILE)?;

        let mut graph = Graph::new();
        let mut remap: BTreeMap<u64, NodeId> = BTreeMap::new();
        for (old_id, unit) in vertices {
            remap.insert(old_id, graph.add_node(unit));
        }

        let resolve = |old: u64| -> Result<NodeId> {
            remap
                .get(&old)
                .copied()
                .ok_or_else(|| Error::Cache(format!("graph cache names unknown vertex {old}")))
        };

        for (from, to) in &edges {
            graph
                .add_edge(resolve(*from)?, resolve(*to)?)
                .map_err(|e| Error::Cache(format!("graph cache is corrupted: {e}")))?;
        }

        // The neighbor index is derived data; disagreement means a torn or
        // hand-edited cache.
        for (old, outs) in &neighbors {
            let id = resolve(*old)?;
            let mut expected: Vec<NodeId> =
                outs.iter().map(|&o| resolve(o)).collect::<Result<_>>()?;
            expected.sort();
            let actual = graph
                .out_neighbors(id)
                .map_err(|e| Error::Cache(format!("graph cache is corrupted: {e}")))?;
            if actual != expected {
                return Err(Error::Cache(format!(
                    "graph cache is corrupted: neighbor index disagrees for vertex {old}"
                )));
            }
        }

        Ok(graph)
    }

    /// Persist the environment table, stamping [`env::STAMP_KEY`] first so
    /// the file is guaranteed to differ across saves.
    pub fn save_env(&self, table: &mut EnvTable) -> Result<()> {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        table.put(env::STAMP_KEY, stamp)?;
        self.write_json(TABLE_FILE, table)
    }

    /// Restore the environment table saved by [`CacheStore::save_env`].
    pub fn load_env(&self) -> Result<EnvTable> {
        self.read_json(TABLE_FILE)
    }

    /// Persist compiled script artifacts verbatim, one file per module.
    pub fn save_mods(&self, mods: &[(String, Vec<u8>)]) -> Result<()> {
        self.ensure_dir()?;
        for (module, artifact) in mods {
            let path = self.file(&format!("{module}.{ARTIFACT_SUFFIX}"));
            fs::write(&path, artifact)
                .map_err(|e| Error::Cache(format!("could not write '{}': {e}", path.display())))?;
        }
        Ok(())
    }

    /// Read back every persisted artifact as `(module, bytes)` pairs.
    pub fn load_mods(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut mods = Vec::new();
        for path in self.artifact_files()? {
            let module = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let bytes = fs::read(&path)
                .map_err(|e| Error::Cache(format!("could not read '{}': {e}", path.display())))?;
            mods.push((module, bytes));
        }
        mods.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(mods)
    }

    /// Add entries to the invalidation manifest, preserving order and
    /// dropping duplicates.
    pub fn append_manifest(&self, files: &[PathBuf]) -> Result<()> {
        let mut entries = self.manifest_list()?;
        for file in files {
            if !entries.contains(file) {
                entries.push(file.clone());
            }
        }

        self.ensure_dir()?;
        let path = self.file(MANIFEST_FILE);
        let mut text = String::new();
        for entry in &entries {
            text.push_str(&entry.display().to_string());
            text.push('\n');
        }
        fs::write(&path, text)
            .map_err(|e| Error::Cache(format!("could not write '{}': {e}", path.display())))
    }

    /// The invalidation manifest. A missing manifest reads as empty.
    pub fn manifest_list(&self) -> Result<Vec<PathBuf>> {
        let path = self.file(MANIFEST_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Cache(format!(
                    "could not read '{}': {e}",
                    path.display()
                )));
            }
        };
        Ok(text
            .lines()
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Persist the tail arguments and the precious environment variables so
    /// staleness-triggered reruns see the values the user configured with.
    pub fn save_config(&self, args: &[String], precious: &BTreeMap<String, String>) -> Result<()> {
        self.write_json(CONFIG_ARG_FILE, &args)?;
        self.write_json(CONFIG_ENV_FILE, precious)
    }

    /// True when a configuration snapshot has been saved.
    pub fn has_config(&self) -> bool {
        self.file(CONFIG_ARG_FILE).exists() && self.file(CONFIG_ENV_FILE).exists()
    }

    /// Restore the configuration snapshot.
    pub fn load_config(&self) -> Result<(Vec<String>, BTreeMap<String, String>)> {
        let args: Vec<String> = self.read_json(CONFIG_ARG_FILE)?;
        let precious: BTreeMap<String, String> = self.read_json(CONFIG_ENV_FILE)?;
        Ok((args, precious))
    }

    /// Persist captured fallback records.
    pub fn save_fallbacks(&self, fallbacks: &[Fallback]) -> Result<()> {
        self.write_json(FALLBACKS_FILE, &fallbacks)
    }

    /// Restore fallback records. Missing file reads as none.
    pub fn load_fallbacks(&self) -> Result<Vec<Fallback>> {
        if !self.file(FALLBACKS_FILE).exists() {
            return Ok(Vec::new());
        }
        self.read_json(FALLBACKS_FILE)
    }

    fn artifact_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Cache(format!(
                    "could not read '{}': {e}",
                    self.dir.display()
                )));
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                Error::Cache(format!("could not read '{}': {e}", self.dir.display()))
            })?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some(ARTIFACT_SUFFIX) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Is the cache stale with respect to the manifest?
    ///
    /// True when the manifest is empty, or when the newest manifest entry is
    /// newer than the oldest cache file (compiled artifacts included).
    /// Missing files on either side read as the epoch.
    pub fn is_stale(&self) -> Result<bool> {
        let manifest = self.manifest_list()?;
        if manifest.is_empty() {
            return Ok(true);
        }

        let newest_input = manifest
            .iter()
            .map(|p| mtime(p))
            .max()
            .unwrap_or_else(FileTime::zero);

        let mut cache_files: Vec<PathBuf> = [
            VERTICES_FILE,
            EDGES_FILE,
            NEIGHBORS_FILE,
            TABLE_FILE,
            CONFIG_ENV_FILE,
            CONFIG_ARG_FILE,
            FALLBACKS_FILE,
        ]
        .iter()
        .map(|name| self.file(name))
        .collect();
        cache_files.extend(self.artifact_files()?);

        let oldest_cache = cache_files
            .iter()
            .map(|p| mtime(p))
            .min()
            .unwrap_or_else(FileTime::zero);

        Ok(newest_input > oldest_cache)
    }

    /// Remove every cache file and artifact. Missing files are ignored.
    pub fn clear(&self) -> Result<()> {
        let mut files: Vec<PathBuf> = [
            VERTICES_FILE,
            EDGES_FILE,
            NEIGHBORS_FILE,
            TABLE_FILE,
            MANIFEST_FILE,
            CONFIG_ENV_FILE,
            CONFIG_ARG_FILE,
            FALLBACKS_FILE,
        ]
        .iter()
        .map(|name| self.file(name))
        .collect();
        files.extend(self.artifact_files()?);

        for path in files {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::Cache(format!(
                        "could not remove '{}': {e}",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{RecipeRef, Rule, Task};
    use tempfile::TempDir;

    fn rule(target: &str, source: &str) -> WorkUnit {
        WorkUnit::Rule(Rule {
            targets: vec![PathBuf::from(target)],
            sources: vec![PathBuf::from(source)],
            recipe: RecipeRef::new("Demo.Exmakefile", "compile", 2),
            directory: PathBuf::from("."),
        })
    }

    #[test]
    fn test_graph_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join(DEFAULT_DIR));

        let mut graph = Graph::new();
        let obj = graph.add_node(rule("foo.o", "foo.c"));
        let bin = graph.add_node(rule("foo", "foo.o"));
        graph.add_edge(bin, obj).unwrap();

        store.save_graph(&graph).unwrap();
        let loaded = store.load_graph().unwrap();

        assert_eq!(loaded.node_count(), 2);
        assert_eq!(loaded.edge_count(), 1);
        assert_eq!(loaded.leaves().len(), 1);
        let leaf = loaded.leaves()[0];
        assert_eq!(loaded.node(leaf).unwrap().display_name(), "foo.o");
    }

    #[test]
    fn test_env_roundtrip_and_stamp() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join(DEFAULT_DIR));

        let mut table = EnvTable::new();
        table.put("CC", "gcc").unwrap();
        table.list_append("CFLAGS", "-O2").unwrap();

        store.save_env(&mut table).unwrap();
        let loaded = store.load_env().unwrap();

        assert_eq!(loaded, table);
        assert!(loaded.get(env::STAMP_KEY).is_some());
    }

    #[test]
    fn test_mods_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join(DEFAULT_DIR));

        let mods = vec![
            ("A.Exmakefile".to_string(), b"alpha".to_vec()),
            ("B.Exmakefile".to_string(), b"beta".to_vec()),
        ];
        store.save_mods(&mods).unwrap();

        let loaded = store.load_mods().unwrap();
        assert_eq!(loaded, mods);
    }

    #[test]
    fn test_manifest_appends_without_duplicates() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join(DEFAULT_DIR));

        store
            .append_manifest(&[PathBuf::from("Exmakefile"), PathBuf::from("sub/Exmakefile")])
            .unwrap();
        store
            .append_manifest(&[PathBuf::from("Exmakefile"), PathBuf::from("extra.conf")])
            .unwrap();

        let list = store.manifest_list().unwrap();
        assert_eq!(
            list,
            vec![
                PathBuf::from("Exmakefile"),
                PathBuf::from("sub/Exmakefile"),
                PathBuf::from("extra.conf"),
            ]
        );
    }

    #[test]
    fn test_config_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join(DEFAULT_DIR));
        assert!(!store.has_config());

        let mut precious = BTreeMap::new();
        precious.insert("CC".to_string(), "clang".to_string());
        store
            .save_config(&["--release".to_string()], &precious)
            .unwrap();

        assert!(store.has_config());
        let (args, vars) = store.load_config().unwrap();
        assert_eq!(args, vec!["--release"]);
        assert_eq!(vars.get("CC").map(String::as_str), Some("clang"));
    }

    #[test]
    fn test_fallbacks_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join(DEFAULT_DIR));
        assert!(store.load_fallbacks().unwrap().is_empty());

        let fallbacks = vec![Fallback {
            recipe: RecipeRef::new("Demo.Exmakefile", "help", 1),
            directory: PathBuf::from("."),
        }];
        store.save_fallbacks(&fallbacks).unwrap();
        assert_eq!(store.load_fallbacks().unwrap(), fallbacks);
    }

    #[test]
    fn test_stale_when_manifest_empty() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join(DEFAULT_DIR));
        assert!(store.is_stale().unwrap());
    }

    #[test]
    fn test_stale_tracks_manifest_mtime() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join(DEFAULT_DIR));

        let script = tmp.path().join("Exmakefile");
        std::fs::write(&script, "demo").unwrap();

        // Write the full cache set, then record the script in the manifest.
        let mut graph = Graph::new();
        let _ = graph.add_node(rule("a", "b"));
        store.save_graph(&graph).unwrap();
        store.save_env(&mut EnvTable::new()).unwrap();
        store.save_config(&[], &BTreeMap::new()).unwrap();
        store.save_fallbacks(&[]).unwrap();
        store.append_manifest(&[script.clone()]).unwrap();

        assert!(!store.is_stale().unwrap());

        // Touch the script into the future; the cache must go stale.
        let future = FileTime::from_unix_time(mtime(&script).unix_seconds() + 10, 0);
        filetime::set_file_mtime(&script, future).unwrap();
        assert!(store.is_stale().unwrap());
    }

    #[test]
    fn test_clear_removes_everything() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join(DEFAULT_DIR));

        store.save_env(&mut EnvTable::new()).unwrap();
        store
            .save_mods(&[("A.Exmakefile".to_string(), b"x".to_vec())])
            .unwrap();
        store.append_manifest(&[PathBuf::from("Exmakefile")]).unwrap();

        store.clear().unwrap();
        assert!(store.manifest_list().unwrap().is_empty());
        assert!(store.load_mods().unwrap().is_empty());
        assert!(store.load_env().is_err());
    }

    #[test]
    fn test_task_unit_survives_graph_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join(DEFAULT_DIR));

        let mut graph = Graph::new();
        let _ = graph.add_node(WorkUnit::Task(Task {
            name: PathBuf::from("./all"),
            sources: vec![PathBuf::from("./foo")],
            real_sources: vec![],
            recipe: RecipeRef::new("Demo.Exmakefile", "all", 3),
            directory: PathBuf::from("."),
        }));

        store.save_graph(&graph).unwrap();
        let loaded = store.load_graph().unwrap();
        let id = loaded.node_ids()[0];
        assert!(matches!(loaded.node(id).unwrap(), WorkUnit::Task(_)));
    }
}
