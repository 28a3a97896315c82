// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Output dependency graph
//!
//! Rebuilt from the metadata store at the start of each decision pass. The
//! forward direction links producers to the outputs derived from them; the
//! backward sweep annotates every record with `up_to_date`, including the
//! rule that lets intentionally cleaned intermediates stand in for their
//! files as long as everything downstream is current.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::errors::SeqflowError;
use crate::meta::{mtime_ms, OutputMeta};

/// A vertex in the dependency graph
///
/// Records produced from the same inputs by the same command share a node.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Metadata records at this position in the DAG
    pub values: Vec<OutputMeta>,
}

impl GraphNode {
    fn label(&self) -> String {
        self.values
            .iter()
            .map(|v| v.output_path.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Dependency graph over persisted output metadata
pub struct DependencyGraph {
    graph: DiGraph<GraphNode, ()>,
    /// Output path -> owning node
    path_to_node: HashMap<String, NodeIndex>,
    /// Topological order cached from the build
    topo: Vec<NodeIndex>,
    /// Root for resolving relative output paths
    workdir: PathBuf,
}

impl DependencyGraph {
    /// Build the graph from the full set of scanned records and annotate
    /// every record with `max_timestamp` and `up_to_date`.
    ///
    /// Input order (ascending timestamp, as `scan` returns) is preserved
    /// within nodes. A cycle is a hard error.
    pub fn build(metas: Vec<OutputMeta>, workdir: impl Into<PathBuf>) -> Result<Self, SeqflowError> {
        let workdir = workdir.into();
        let mut graph: DiGraph<GraphNode, ()> = DiGraph::new();
        let mut path_to_node = HashMap::new();

        // Records produced by the same command from the same inputs occupy
        // one node; scan order is preserved within it.
        let mut group_index: HashMap<(Vec<String>, String), NodeIndex> = HashMap::new();
        for meta in metas {
            let key = (meta.inputs.clone(), meta.command.clone());
            match group_index.get(&key) {
                Some(&node) => {
                    path_to_node.insert(meta.output_path.clone(), node);
                    graph[node].values.push(meta);
                }
                None => {
                    let path = meta.output_path.clone();
                    let node = graph.add_node(GraphNode { values: vec![meta] });
                    group_index.insert(key, node);
                    path_to_node.insert(path, node);
                }
            }
        }

        // Producer -> consumer edges wherever an input names a known output
        let mut edges = Vec::new();
        for node in graph.node_indices() {
            let mut seen = HashSet::new();
            for value in &graph[node].values {
                for input in &value.inputs {
                    if let Some(&producer) = path_to_node.get(input) {
                        if producer != node && seen.insert(producer) {
                            edges.push((producer, node));
                        }
                    }
                }
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        let topo = toposort(&graph, None).map_err(|cycle| SeqflowError::DependencyCycle {
            outputs: cycle_outputs(&graph, cycle.node_id()),
        })?;

        let mut built = Self {
            graph,
            path_to_node,
            topo,
            workdir,
        };
        built.propagate_timestamps();
        built.annotate_up_to_date();
        Ok(built)
    }

    /// Forward sweep: `max_timestamp` is the record's own timestamp or the
    /// largest `max_timestamp` among the parents that produced its inputs.
    fn propagate_timestamps(&mut self) {
        for &node in &self.topo {
            // Parent output -> max_timestamp, gathered before mutating
            let mut parent_ts: HashMap<String, i64> = HashMap::new();
            for parent in self.graph.neighbors_directed(node, Direction::Incoming) {
                for q in &self.graph[parent].values {
                    parent_ts.insert(q.output_path.clone(), q.max_timestamp);
                }
            }

            for p in &mut self.graph[node].values {
                let inherited = p
                    .inputs
                    .iter()
                    .filter_map(|i| parent_ts.get(i))
                    .copied()
                    .max()
                    .unwrap_or(i64::MIN);
                p.max_timestamp = p.timestamp.max(inherited);
            }
        }
    }

    /// Backward sweep computing `up_to_date` for every record.
    fn annotate_up_to_date(&mut self) {
        for &node in self.topo.clone().iter().rev() {
            let mut parent_ts: HashMap<String, i64> = HashMap::new();
            for parent in self.graph.neighbors_directed(node, Direction::Incoming) {
                for q in &self.graph[parent].values {
                    parent_ts.insert(q.output_path.clone(), q.max_timestamp);
                }
            }

            let children: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect();
            let children_current = !children.is_empty()
                && children
                    .iter()
                    .all(|&c| self.graph[c].values.iter().all(|v| v.up_to_date));

            let workdir = self.workdir.clone();
            for p in &mut self.graph[node].values {
                let newer_input = p
                    .inputs
                    .iter()
                    .filter_map(|i| parent_ts.get(i))
                    .any(|&ts| ts >= p.timestamp);

                p.up_to_date = if newer_input {
                    false
                } else if resolve(&workdir, &p.output_file).exists() {
                    true
                } else if !p.cleaned {
                    false
                } else {
                    // Cleaned: stands in for the file while everything
                    // downstream is current. A cleaned leaf is stale.
                    children_current
                };
            }
        }
    }

    /// Locate the record for an output path.
    pub fn entry_for(&self, output: &str) -> Option<&OutputMeta> {
        let node = self.path_to_node.get(output)?;
        self.graph[*node].values.iter().find(|v| v.output_path == output)
    }

    /// All records, in topological order.
    pub fn entries(&self) -> impl Iterator<Item = &OutputMeta> {
        self.topo.iter().flat_map(|&n| self.graph[n].values.iter())
    }

    /// Restrict the graph to the ancestors and descendants of one output,
    /// keeping the computed annotations. Returns `None` for an unknown path.
    pub fn filter(&self, output: &str) -> Option<Self> {
        let &focus = self.path_to_node.get(output)?;

        let mut keep: HashSet<NodeIndex> = HashSet::new();
        keep.insert(focus);
        collect_reachable(&self.graph, focus, Direction::Incoming, &mut keep);
        collect_reachable(&self.graph, focus, Direction::Outgoing, &mut keep);

        let graph = self.graph.filter_map(
            |idx, node| keep.contains(&idx).then(|| node.clone()),
            |_, _| Some(()),
        );

        let mut path_to_node = HashMap::new();
        for idx in graph.node_indices() {
            for value in &graph[idx].values {
                path_to_node.insert(value.output_path.clone(), idx);
            }
        }

        // The subgraph of a DAG cannot cycle
        let topo = toposort(&graph, None).ok()?;

        Some(Self {
            graph,
            path_to_node,
            topo,
            workdir: self.workdir.clone(),
        })
    }

    /// Nodes with no children, in depth-first order from the roots. These
    /// are the pipeline's final outputs.
    pub fn leaves(&self) -> Vec<&GraphNode> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();

        let roots: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();

        for root in roots {
            self.leaves_from(root, &mut visited, &mut order);
        }

        order.iter().map(|&n| &self.graph[n]).collect()
    }

    fn leaves_from(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        order: &mut Vec<NodeIndex>,
    ) {
        if !visited.insert(node) {
            return;
        }

        let mut any_child = false;
        for child in self.graph.neighbors_directed(node, Direction::Outgoing) {
            any_child = true;
            self.leaves_from(child, visited, order);
        }

        if !any_child {
            order.push(node);
        }
    }

    /// Decide whether `outputs` must be rebuilt given `inputs`.
    ///
    /// With no outputs there is nothing to build. With no inputs the
    /// outputs only need to exist. Otherwise an output on disk that is not
    /// newer than every input forces a rebuild; a missing output is
    /// acceptable only if its record says it was cleaned and the graph
    /// shows it up to date.
    pub fn check_up_to_date(&self, outputs: &[String], inputs: &[String]) -> bool {
        if outputs.is_empty() {
            return true;
        }

        if inputs.is_empty() {
            return outputs
                .iter()
                .all(|o| resolve(&self.workdir, Path::new(o)).exists());
        }

        // A named input that has vanished forces the rebuild
        let newest_input = inputs
            .iter()
            .map(|i| mtime_ms(&resolve(&self.workdir, Path::new(i))).unwrap_or(i64::MAX))
            .max()
            .unwrap_or(i64::MIN);

        let older: Vec<&String> = outputs
            .iter()
            .filter(|o| match mtime_ms(&resolve(&self.workdir, Path::new(o))) {
                Some(ts) => newest_input >= ts,
                None => true,
            })
            .collect();

        if older
            .iter()
            .any(|o| resolve(&self.workdir, Path::new(o.as_str())).exists())
        {
            return false;
        }

        older.iter().all(|o| match self.entry_for(o.as_str()) {
            Some(p) => p.cleaned && p.up_to_date,
            None => true,
        })
    }

    /// Generate a DOT rendering with staleness annotations.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph outputs {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            let color = if node.values.iter().all(|v| v.up_to_date) {
                "darkgreen"
            } else {
                "red"
            };
            out.push_str(&format!(
                "    \"{}\" [color={}];\n",
                node.label(),
                color
            ));
        }

        for edge in self.graph.edge_references() {
            out.push_str(&format!(
                "    \"{}\" -> \"{}\";\n",
                self.graph[edge.source()].label(),
                self.graph[edge.target()].label()
            ));
        }

        out.push_str("}\n");
        out
    }

    /// Generate a Mermaid rendering.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");

        for (i, idx) in self.graph.node_indices().enumerate() {
            out.push_str(&format!("    n{}[\"{}\"]\n", i, self.graph[idx].label()));
        }

        let positions: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .enumerate()
            .map(|(i, idx)| (idx, i))
            .collect();

        for edge in self.graph.edge_references() {
            out.push_str(&format!(
                "    n{} --> n{}\n",
                positions[&edge.source()],
                positions[&edge.target()]
            ));
        }

        out
    }

    /// Generate a line-per-record listing in topological order.
    pub fn to_text(&self) -> String {
        let mut out = String::new();

        for value in self.entries() {
            let state = if value.up_to_date {
                "up-to-date"
            } else if value.cleaned {
                "cleaned, stale"
            } else {
                "stale"
            };
            out.push_str(&format!("{} [{}]", value.output_path, state));
            if value.preserve {
                out.push_str(" [preserved]");
            }
            if !value.inputs.is_empty() {
                out.push_str(&format!(" <- {}", value.inputs.join(", ")));
            }
            out.push('\n');
        }

        out
    }
}

fn resolve(workdir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

fn collect_reachable(
    graph: &DiGraph<GraphNode, ()>,
    from: NodeIndex,
    direction: Direction,
    into: &mut HashSet<NodeIndex>,
) {
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        for next in graph.neighbors_directed(node, direction) {
            if into.insert(next) {
                stack.push(next);
            }
        }
    }
}

/// Outputs involved in a cycle, for the error message.
fn cycle_outputs(graph: &DiGraph<GraphNode, ()>, start: NodeIndex) -> Vec<String> {
    let mut outputs: Vec<String> = graph[start]
        .values
        .iter()
        .map(|v| v.output_path.clone())
        .collect();

    let mut visited = HashSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            if next == start {
                continue;
            }
            if visited.insert(next) {
                outputs.extend(graph[next].values.iter().map(|v| v.output_path.clone()));
                stack.push(next);
            }
        }
    }

    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(output: &str, inputs: &[&str], timestamp: i64) -> OutputMeta {
        let mut m = OutputMeta::new(output);
        m.inputs = inputs.iter().map(|s| s.to_string()).collect();
        m.command = format!("make {}", output);
        m.timestamp = timestamp;
        m
    }

    fn touch(dir: &TempDir, name: &str) {
        std::fs::write(dir.path().join(name), name).unwrap();
    }

    #[test]
    fn test_linear_chain_layering() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.txt");
        touch(&dir, "b.txt");
        touch(&dir, "c.txt");

        let graph = DependencyGraph::build(
            vec![
                meta("a.txt", &["raw.fq"], 100),
                meta("b.txt", &["a.txt"], 200),
                meta("c.txt", &["b.txt"], 300),
            ],
            dir.path(),
        )
        .unwrap();

        // Every input of every record is a parent output or external
        let b = graph.entry_for("b.txt").unwrap();
        assert_eq!(b.inputs, vec!["a.txt"]);
        assert_eq!(graph.entry_for("a.txt").unwrap().max_timestamp, 100);
        assert_eq!(b.max_timestamp, 200);
        assert_eq!(graph.entry_for("c.txt").unwrap().max_timestamp, 300);
    }

    #[test]
    fn test_max_timestamp_inherits_from_parent() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.txt");
        touch(&dir, "b.txt");

        // Parent carries a newer timestamp than its child
        let graph = DependencyGraph::build(
            vec![meta("a.txt", &[], 500), meta("b.txt", &["a.txt"], 200)],
            dir.path(),
        )
        .unwrap();

        assert_eq!(graph.entry_for("b.txt").unwrap().max_timestamp, 500);
    }

    #[test]
    fn test_touched_input_marks_descendants_stale() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.txt");
        touch(&dir, "b.txt");
        touch(&dir, "c.txt");

        // All current
        let graph = DependencyGraph::build(
            vec![
                meta("a.txt", &[], 100),
                meta("b.txt", &["a.txt"], 200),
                meta("c.txt", &["b.txt"], 300),
            ],
            dir.path(),
        )
        .unwrap();
        assert!(graph.entry_for("c.txt").unwrap().up_to_date);

        // Root bumped past its child: the chain below goes stale
        let graph = DependencyGraph::build(
            vec![
                meta("a.txt", &[], 201),
                meta("b.txt", &["a.txt"], 200),
                meta("c.txt", &["b.txt"], 300),
            ],
            dir.path(),
        )
        .unwrap();
        assert!(!graph.entry_for("b.txt").unwrap().up_to_date);
    }

    #[test]
    fn test_equal_timestamps_force_recompute() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.txt");
        touch(&dir, "b.txt");

        let graph = DependencyGraph::build(
            vec![meta("a.txt", &[], 200), meta("b.txt", &["a.txt"], 200)],
            dir.path(),
        )
        .unwrap();

        assert!(!graph.entry_for("b.txt").unwrap().up_to_date);
    }

    #[test]
    fn test_cleaned_intermediate_with_current_downstream() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.txt");
        touch(&dir, "c.txt");
        // b.txt deliberately absent

        let mut b = meta("b.txt", &["a.txt"], 200);
        b.cleaned = true;

        let graph = DependencyGraph::build(
            vec![meta("a.txt", &[], 100), b, meta("c.txt", &["b.txt"], 300)],
            dir.path(),
        )
        .unwrap();

        assert!(graph.entry_for("c.txt").unwrap().up_to_date);
        assert!(graph.entry_for("b.txt").unwrap().up_to_date);
    }

    #[test]
    fn test_cleaned_leaf_is_stale() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.txt");

        let mut b = meta("b.txt", &["a.txt"], 200);
        b.cleaned = true;

        let graph =
            DependencyGraph::build(vec![meta("a.txt", &[], 100), b], dir.path()).unwrap();

        assert!(!graph.entry_for("b.txt").unwrap().up_to_date);
    }

    #[test]
    fn test_missing_not_cleaned_is_stale() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.txt");

        let graph = DependencyGraph::build(
            vec![meta("a.txt", &[], 100), meta("b.txt", &["a.txt"], 200)],
            dir.path(),
        )
        .unwrap();

        assert!(!graph.entry_for("b.txt").unwrap().up_to_date);
    }

    #[test]
    fn test_cycle_is_fatal() {
        let dir = TempDir::new().unwrap();

        let result = DependencyGraph::build(
            vec![meta("a.txt", &["b.txt"], 100), meta("b.txt", &["a.txt"], 200)],
            dir.path(),
        );

        match result {
            Err(SeqflowError::DependencyCycle { outputs }) => {
                assert!(outputs.contains(&"a.txt".to_string()));
            }
            _ => panic!("expected DependencyCycle"),
        }
    }

    #[test]
    fn test_check_up_to_date_empty_outputs() {
        let dir = TempDir::new().unwrap();
        let graph = DependencyGraph::build(vec![], dir.path()).unwrap();
        assert!(graph.check_up_to_date(&[], &["in.txt".into()]));
    }

    #[test]
    fn test_check_up_to_date_empty_inputs_is_existence() {
        let dir = TempDir::new().unwrap();
        let graph = DependencyGraph::build(vec![], dir.path()).unwrap();

        assert!(!graph.check_up_to_date(&["out.txt".into()], &[]));
        touch(&dir, "out.txt");
        assert!(graph.check_up_to_date(&["out.txt".into()], &[]));
    }

    #[test]
    fn test_check_up_to_date_older_existing_output() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "out.txt");

        // Make the input strictly newer than the output
        let out_path = dir.path().join("out.txt");
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
        let file = std::fs::File::options().write(true).open(&out_path).unwrap();
        file.set_modified(old).unwrap();
        drop(file);
        touch(&dir, "in.txt");

        let graph = DependencyGraph::build(vec![], dir.path()).unwrap();
        assert!(!graph.check_up_to_date(&["out.txt".into()], &["in.txt".into()]));
    }

    #[test]
    fn test_check_up_to_date_cleaned_missing_output() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "in.txt");
        touch(&dir, "final.txt");

        let mut cleaned = meta("mid.txt", &["in.txt"], 100);
        cleaned.cleaned = true;

        let graph = DependencyGraph::build(
            vec![cleaned, meta("final.txt", &["mid.txt"], 200)],
            dir.path(),
        )
        .unwrap();

        assert!(graph.check_up_to_date(&["mid.txt".into()], &["in.txt".into()]));
    }

    #[test]
    fn test_filter_keeps_lineage() {
        let dir = TempDir::new().unwrap();
        for f in ["a.txt", "b.txt", "c.txt", "other.txt"] {
            touch(&dir, f);
        }

        let graph = DependencyGraph::build(
            vec![
                meta("a.txt", &[], 100),
                meta("b.txt", &["a.txt"], 200),
                meta("c.txt", &["b.txt"], 300),
                meta("other.txt", &["x.fq"], 400),
            ],
            dir.path(),
        )
        .unwrap();

        let filtered = graph.filter("b.txt").unwrap();
        assert!(filtered.entry_for("a.txt").is_some());
        assert!(filtered.entry_for("c.txt").is_some());
        assert!(filtered.entry_for("other.txt").is_none());
    }

    #[test]
    fn test_leaves_are_final_outputs() {
        let dir = TempDir::new().unwrap();

        let graph = DependencyGraph::build(
            vec![
                meta("a.txt", &[], 100),
                meta("b.txt", &["a.txt"], 200),
                meta("c.txt", &["a.txt"], 300),
            ],
            dir.path(),
        )
        .unwrap();

        let leaves = graph.leaves();
        let mut labels: Vec<String> = leaves.iter().map(|n| n.label()).collect();
        labels.sort();
        assert_eq!(labels, vec!["b.txt", "c.txt"]);
    }

    #[test]
    fn test_dot_marks_stale_nodes() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.txt");

        let graph = DependencyGraph::build(
            vec![meta("a.txt", &[], 100), meta("b.txt", &["a.txt"], 200)],
            dir.path(),
        )
        .unwrap();

        let dot = graph.to_dot();
        assert!(dot.contains("\"a.txt\" [color=darkgreen]"));
        assert!(dot.contains("\"b.txt\" [color=red]"));
        assert!(dot.contains("\"a.txt\" -> \"b.txt\""));
    }
}
