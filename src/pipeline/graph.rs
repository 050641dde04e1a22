//! Pipeline topology graph.
//!
//! Tracks every node by name and every link between them, and enforces
//! the structural rules the executor relies on:
//!
//! - node names are unique (the graph is the named-unit lookup table)
//! - an input accepts one link, unless the node is a muxer
//! - an output feeds one link, unless the node is a demuxer or tee
//! - no cycles
//!
//! The graph is pure bookkeeping: it owns no channels or threads. The
//! router mutates it (under a mutex) while linking dynamic branches, and
//! the controller reads it for teardown ordering and reporting.

use crate::element::NodeKind;
use crate::error::{Error, Result};
use daggy::{Dag, NodeIndex, Walker};
use std::collections::HashMap;

/// A node in the pipeline graph.
#[derive(Debug, Clone)]
pub struct Node {
    /// Unique node name.
    pub name: String,
    /// Topology role.
    pub kind: NodeKind,
}

/// A link between two nodes.
#[derive(Debug, Clone, Default)]
pub struct Link;

/// The pipeline topology.
#[derive(Default)]
pub struct Pipeline {
    graph: Dag<Node, Link>,
    nodes_by_name: HashMap<String, NodeIndex>,
    insertion_order: Vec<String>,
}

impl Pipeline {
    /// Create an empty pipeline graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named node.
    ///
    /// Fails if the name is already taken.
    pub fn add_node(&mut self, name: impl Into<String>, kind: NodeKind) -> Result<()> {
        let name = name.into();
        if self.nodes_by_name.contains_key(&name) {
            return Err(Error::Setup(format!("duplicate node name: {name}")));
        }
        let idx = self.graph.add_node(Node {
            name: name.clone(),
            kind,
        });
        self.nodes_by_name.insert(name.clone(), idx);
        self.insertion_order.push(name);
        Ok(())
    }

    fn index_of(&self, name: &str) -> Result<NodeIndex> {
        self.nodes_by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::Link(format!("unknown node: {name}")))
    }

    fn in_degree(&self, idx: NodeIndex) -> usize {
        self.graph.parents(idx).iter(&self.graph).count()
    }

    fn out_degree(&self, idx: NodeIndex) -> usize {
        self.graph.children(idx).iter(&self.graph).count()
    }

    /// Link `src` to `dst`.
    ///
    /// Enforces single-subscriber inputs (except muxers), single-output
    /// sources (except demuxers and tees), and acyclicity.
    pub fn link(&mut self, src: &str, dst: &str) -> Result<()> {
        let src_idx = self.index_of(src)?;
        let dst_idx = self.index_of(dst)?;

        let src_kind = self.graph[src_idx].kind;
        let dst_kind = self.graph[dst_idx].kind;

        if matches!(src_kind, NodeKind::Sink) {
            return Err(Error::Link(format!("{src} is a sink and has no output")));
        }
        if matches!(dst_kind, NodeKind::Source) {
            return Err(Error::Link(format!("{dst} is a source and has no input")));
        }
        if !src_kind.multi_output() && self.out_degree(src_idx) > 0 {
            return Err(Error::Link(format!("{src} output is already linked")));
        }
        if !dst_kind.multi_input() && self.in_degree(dst_idx) > 0 {
            return Err(Error::Link(format!("{dst} input is already linked")));
        }

        self.graph
            .add_edge(src_idx, dst_idx, Link)
            .map_err(|_| Error::Link(format!("linking {src} -> {dst} would form a cycle")))?;
        Ok(())
    }

    /// Whether the graph contains a node with this name.
    pub fn contains(&self, name: &str) -> bool {
        self.nodes_by_name.contains_key(name)
    }

    /// Topology role of a node, if present.
    pub fn node_kind(&self, name: &str) -> Option<NodeKind> {
        self.nodes_by_name
            .get(name)
            .map(|idx| self.graph[*idx].kind)
    }

    /// Whether a node's input is already linked.
    pub fn is_input_linked(&self, name: &str) -> bool {
        match self.nodes_by_name.get(name) {
            Some(idx) => self.in_degree(*idx) > 0,
            None => false,
        }
    }

    /// Number of outgoing links from a node.
    pub fn output_count(&self, name: &str) -> usize {
        match self.nodes_by_name.get(name) {
            Some(idx) => self.out_degree(*idx),
            None => 0,
        }
    }

    /// Total node count.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Total link count.
    pub fn link_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Node names in construction order.
    pub fn node_names(&self) -> &[String] {
        &self.insertion_order
    }

    /// Node names in teardown order: the reverse of construction order,
    /// so sinks and dynamic branches come down before the demuxer and
    /// source they hang off.
    pub fn teardown_order(&self) -> Vec<String> {
        self.insertion_order.iter().rev().cloned().collect()
    }

    /// Names of nodes with no incoming links.
    pub fn sources(&self) -> Vec<String> {
        self.insertion_order
            .iter()
            .filter(|n| {
                let idx = self.nodes_by_name[*n];
                self.in_degree(idx) == 0
            })
            .cloned()
            .collect()
    }

    /// Names of nodes with no outgoing links.
    pub fn sinks(&self) -> Vec<String> {
        self.insertion_order
            .iter()
            .filter(|n| {
                let idx = self.nodes_by_name[*n];
                self.out_degree(idx) == 0
            })
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("nodes", &self.node_count())
            .field("links", &self.link_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_chain() -> Pipeline {
        let mut p = Pipeline::new();
        p.add_node("src", NodeKind::Source).unwrap();
        p.add_node("demux", NodeKind::Demux).unwrap();
        p.link("src", "demux").unwrap();
        p
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut p = Pipeline::new();
        p.add_node("src", NodeKind::Source).unwrap();
        assert!(p.add_node("src", NodeKind::Sink).is_err());
    }

    #[test]
    fn test_unknown_node_link() {
        let mut p = simple_chain();
        assert!(p.link("demux", "nope").is_err());
    }

    #[test]
    fn test_single_input_enforced() {
        let mut p = simple_chain();
        p.add_node("parse", NodeKind::Transform).unwrap();
        p.add_node("other", NodeKind::Transform).unwrap();
        p.link("demux", "parse").unwrap();
        // parse already has an input
        assert!(p.link("other", "parse").is_err());
        assert!(p.is_input_linked("parse"));
    }

    #[test]
    fn test_mux_accepts_multiple_inputs() {
        let mut p = simple_chain();
        p.add_node("a", NodeKind::Transform).unwrap();
        p.add_node("b", NodeKind::Transform).unwrap();
        p.add_node("mux", NodeKind::Mux).unwrap();
        p.link("demux", "a").unwrap();
        p.link("demux", "b").unwrap();
        p.link("a", "mux").unwrap();
        p.link("b", "mux").unwrap();
        assert_eq!(p.link_count(), 5);
    }

    #[test]
    fn test_single_output_enforced() {
        let mut p = Pipeline::new();
        p.add_node("src", NodeKind::Source).unwrap();
        p.add_node("a", NodeKind::Sink).unwrap();
        p.add_node("b", NodeKind::Sink).unwrap();
        p.link("src", "a").unwrap();
        assert!(p.link("src", "b").is_err());
    }

    #[test]
    fn test_tee_allows_fanout() {
        let mut p = simple_chain();
        p.add_node("tee", NodeKind::Tee).unwrap();
        p.add_node("a", NodeKind::Sink).unwrap();
        p.add_node("b", NodeKind::Sink).unwrap();
        p.link("demux", "tee").unwrap();
        p.link("tee", "a").unwrap();
        p.link("tee", "b").unwrap();
        assert_eq!(p.output_count("tee"), 2);
    }

    #[test]
    fn test_sink_has_no_output() {
        let mut p = Pipeline::new();
        p.add_node("sink", NodeKind::Sink).unwrap();
        p.add_node("t", NodeKind::Transform).unwrap();
        assert!(p.link("sink", "t").is_err());
    }

    #[test]
    fn test_teardown_order_is_reversed() {
        let mut p = simple_chain();
        p.add_node("sink", NodeKind::Sink).unwrap();
        let order = p.teardown_order();
        assert_eq!(order, vec!["sink", "demux", "src"]);
    }

    #[test]
    fn test_sources_and_sinks() {
        let p = simple_chain();
        assert_eq!(p.sources(), vec!["src"]);
        assert_eq!(p.sinks(), vec!["demux"]);
    }
}
