//! Dependency graph collaborator.
//!
//! Ward does not parse source code. External parsers write a plain
//! node/edge model to `.ward/graph.json`; ward only reads it to compute
//! impact sets and to attach per-module facts to learned knowledge.
//!
//! # File format
//!
//! ```json
//! {
//!   "edges": [{ "from": "app.py", "to": "util.py", "kind": "imports" }],
//!   "modules": {
//!     "util.py": { "interfaces": ["parse"], "imports": ["os"], "lineCount": 120 }
//!   }
//! }
//! ```
//!
//! An edge `from -> to` means `from` depends on `to`. The impact set of a
//! file is everything that (transitively) depends on it.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::WardError;
use crate::fsutil::read_json;

// ============================================================================
// Types
// ============================================================================

/// Facts about one module, as reported by the upstream parsers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleFacts {
    /// Exported interfaces (functions, classes, types).
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Imported modules.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Number of lines in the file when parsed.
    #[serde(default)]
    pub line_count: u64,
}

/// A dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    /// The dependent file.
    pub from: String,
    /// The file depended upon.
    pub to: String,
    /// Relationship type (`imports`, `calls`, ...). Informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// On-disk graph document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphFile {
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleFacts>,
}

// ============================================================================
// DependencyGraph Trait
// ============================================================================

/// Read-only view of the project's dependency graph.
///
/// All paths are project-relative keys (`src/lib.rs`).
pub trait DependencyGraph: Send + Sync {
    /// Files transitively dependent on any of `files`, excluding `files` themselves.
    fn impact_set(&self, files: &[String]) -> BTreeSet<String>;

    /// Parser facts for one module, if the graph knows it.
    fn module_facts(&self, path: &str) -> Option<ModuleFacts>;
}

/// A graph with no nodes. Used when no graph file exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyGraph;

impl DependencyGraph for EmptyGraph {
    fn impact_set(&self, _files: &[String]) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn module_facts(&self, _path: &str) -> Option<ModuleFacts> {
        None
    }
}

// ============================================================================
// EdgeListGraph
// ============================================================================

/// In-memory graph built from an edge list, indexed by dependency target.
#[derive(Debug, Clone, Default)]
pub struct EdgeListGraph {
    dependents: HashMap<String, Vec<String>>,
    modules: BTreeMap<String, ModuleFacts>,
}

fn clean_key(path: &str) -> String {
    path.trim_start_matches("./").replace('\\', "/")
}

impl EdgeListGraph {
    /// Build from a parsed graph document.
    pub fn from_graph_file(file: GraphFile) -> Self {
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for edge in file.edges {
            dependents
                .entry(clean_key(&edge.to))
                .or_default()
                .push(clean_key(&edge.from));
        }
        let modules = file
            .modules
            .into_iter()
            .map(|(k, v)| (clean_key(&k), v))
            .collect();
        Self { dependents, modules }
    }

    /// Build from `(from, to)` pairs.
    pub fn from_edges<'a>(edges: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::from_graph_file(GraphFile {
            edges: edges
                .into_iter()
                .map(|(from, to)| GraphEdge {
                    from: from.to_string(),
                    to: to.to_string(),
                    kind: None,
                })
                .collect(),
            modules: BTreeMap::new(),
        })
    }

    /// Number of distinct dependency targets.
    pub fn target_count(&self) -> usize {
        self.dependents.len()
    }
}

impl DependencyGraph for EdgeListGraph {
    fn impact_set(&self, files: &[String]) -> BTreeSet<String> {
        let roots: BTreeSet<String> = files.iter().map(|f| clean_key(f)).collect();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<&str> = roots.iter().map(String::as_str).collect();

        while let Some(current) = queue.pop_front() {
            let Some(deps) = self.dependents.get(current) else {
                continue;
            };
            for dep in deps {
                if !roots.contains(dep) && seen.insert(dep.clone()) {
                    queue.push_back(dep);
                }
            }
        }
        seen
    }

    fn module_facts(&self, path: &str) -> Option<ModuleFacts> {
        self.modules.get(&clean_key(path)).cloned()
    }
}

/// Load the graph at `path`, or an [`EmptyGraph`] when the file is absent.
pub fn load_graph(path: &Path) -> Result<Arc<dyn DependencyGraph>, WardError> {
    match read_json::<GraphFile>(path)? {
        Some(file) => {
            let graph = EdgeListGraph::from_graph_file(file);
            tracing::debug!(
                "Loaded dependency graph from {} ({} targets)",
                path.display(),
                graph.target_count()
            );
            Ok(Arc::new(graph))
        }
        None => {
            tracing::debug!("No dependency graph at {}", path.display());
            Ok(Arc::new(EmptyGraph))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_impact_set_is_transitive_and_excludes_inputs() {
        // app -> service -> util, cli -> util
        let graph = EdgeListGraph::from_edges([
            ("app.py", "service.py"),
            ("service.py", "util.py"),
            ("cli.py", "util.py"),
            ("other.py", "unrelated.py"),
        ]);

        let impact = graph.impact_set(&keys(&["util.py"]));
        let expected: BTreeSet<String> = keys(&["app.py", "cli.py", "service.py"]).into_iter().collect();
        assert_eq!(impact, expected);
    }

    #[test]
    fn test_impact_set_handles_cycles() {
        let graph = EdgeListGraph::from_edges([("a", "b"), ("b", "a"), ("c", "a")]);
        let impact = graph.impact_set(&keys(&["a"]));
        let expected: BTreeSet<String> = keys(&["b", "c"]).into_iter().collect();
        assert_eq!(impact, expected);
    }

    #[test]
    fn test_empty_graph() {
        assert!(EmptyGraph.impact_set(&keys(&["x"])).is_empty());
        assert!(EmptyGraph.module_facts("x").is_none());
    }

    #[test]
    fn test_load_graph_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("graph.json");
        std::fs::write(
            &path,
            r#"{"edges":[{"from":"./b.rs","to":"a.rs","kind":"imports"}],
                "modules":{"a.rs":{"interfaces":["run"],"imports":[],"lineCount":12}}}"#,
        )
        .unwrap();

        let graph = load_graph(&path).unwrap();
        assert_eq!(graph.impact_set(&keys(&["a.rs"])).len(), 1);
        let facts = graph.module_facts("a.rs").unwrap();
        assert_eq!(facts.interfaces, vec!["run".to_string()]);
        assert_eq!(facts.line_count, 12);
    }

    #[test]
    fn test_load_graph_missing_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let graph = load_graph(&temp.path().join("none.json")).unwrap();
        assert!(graph.impact_set(&keys(&["a"])).is_empty());
    }
}
