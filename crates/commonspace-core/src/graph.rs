//! Data-flow graph of the pipeline, rendered as Graphviz DOT.
//!
//! Nodes are stage executions (brain-loop stages once per iteration) plus the
//! input images and the registered outputs. An edge `A → B` means B reads
//! something A wrote.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::MAX_BRAIN_ITERATIONS;
use crate::error::{PipelineError, Result};
use crate::stage::Stage;

const INPUT_NODE: &str = "images";
const OUTPUT_NODE: &str = "registered";

/// One node of the pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Unique, DOT-safe identifier, e.g. `"brain_affine_iter2"`.
    pub id: String,
    /// `None` for the input and output nodes.
    pub stage: Option<Stage>,
    pub iteration: Option<u32>,
}

impl GraphNode {
    fn stage(stage: Stage, iteration: Option<u32>) -> Self {
        let id = match iteration {
            Some(k) => format!("{}_iter{k}", stage.name()),
            None => stage.name().to_string(),
        };
        Self {
            id,
            stage: Some(stage),
            iteration,
        }
    }

    fn terminal(id: &str) -> Self {
        Self {
            id: id.to_string(),
            stage: None,
            iteration: None,
        }
    }

    fn label(&self) -> String {
        match (self.stage, self.iteration) {
            (Some(stage), Some(k)) => format!("{stage}\\niteration {k}"),
            (Some(stage), None) => stage.to_string(),
            (None, _) => self.id.clone(),
        }
    }
}

/// Directed acyclic graph of a pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineGraph {
    nodes: Vec<GraphNode>,
    /// `(from, to)` indices into `nodes`.
    edges: BTreeSet<(usize, usize)>,
}

impl PipelineGraph {
    /// Graph of a full run with the brain loop unrolled `brain_iterations` times.
    pub fn anats_to_common(brain_iterations: u32) -> Result<Self> {
        if !(1..=MAX_BRAIN_ITERATIONS).contains(&brain_iterations) {
            return Err(PipelineError::Input(format!(
                "brain_iterations must be between 1 and {MAX_BRAIN_ITERATIONS}, got {brain_iterations}"
            )));
        }

        let mut g = Self::default();
        let images = g.add(GraphNode::terminal(INPUT_NODE));
        let extraction = g.add(GraphNode::stage(Stage::BrainExtraction, None));
        g.connect(images, extraction);

        let mut current = extraction;
        let mut last = (extraction, extraction);
        for k in 1..=brain_iterations {
            let average = g.add(GraphNode::stage(Stage::BrainAverage, Some(k)));
            let affine = g.add(GraphNode::stage(Stage::BrainAffine, Some(k)));
            g.connect(current, average);
            g.connect(average, affine);
            g.connect(extraction, affine);
            current = affine;
            last = (average, affine);
        }
        let (brain_template, brain_affine) = last;

        let head_mask = g.add(GraphNode::stage(Stage::HeadMask, None));
        let head_init = g.add(GraphNode::stage(Stage::HeadInit, None));
        let head_average = g.add(GraphNode::stage(Stage::HeadAverage, None));
        let head_affine = g.add(GraphNode::stage(Stage::HeadAffine, None));
        let registered = g.add(GraphNode::terminal(OUTPUT_NODE));

        g.connect(extraction, head_mask);
        for from in [images, brain_affine, brain_template, head_mask] {
            g.connect(from, head_init);
        }
        g.connect(head_init, head_average);
        for from in [head_init, head_average, brain_affine] {
            g.connect(from, head_affine);
        }
        g.connect(head_affine, registered);
        Ok(g)
    }

    fn add(&mut self, node: GraphNode) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn connect(&mut self, from: usize, to: usize) {
        self.edges.insert((from, to));
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Edges as `(from_id, to_id)`, sorted by node insertion order.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.edges
            .iter()
            .map(|&(a, b)| (self.nodes[a].id.as_str(), self.nodes[b].id.as_str()))
    }

    /// Direct predecessors of `id`.
    pub fn dependencies_of(&self, id: &str) -> Vec<&GraphNode> {
        let Some(target) = self.nodes.iter().position(|n| n.id == id) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|&&(_, to)| to == target)
            .map(|&(from, _)| &self.nodes[from])
            .collect()
    }

    /// Nodes ordered so every node comes after everything it depends on (Kahn's algorithm).
    pub fn topological_order(&self) -> Vec<&GraphNode> {
        let mut in_degree: HashMap<usize, usize> = (0..self.nodes.len()).map(|i| (i, 0)).collect();
        for &(_, to) in &self.edges {
            *in_degree.entry(to).or_default() += 1;
        }

        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|i| in_degree[i] == 0)
            .collect();
        let mut sorted = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop_front() {
            sorted.push(&self.nodes[node]);
            for &(_, to) in self.edges.iter().filter(|&&(from, _)| from == node) {
                if let Some(deg) = in_degree.get_mut(&to) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(to);
                    }
                }
            }
        }
        sorted
    }

    /// Render as DOT. Identical graphs render to identical text.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph anats_to_common {\n    rankdir=TB;\n    node [shape=box];\n");
        for node in &self.nodes {
            let shape = if node.stage.is_none() { ", shape=folder" } else { "" };
            let _ = writeln!(out, "    \"{}\" [label=\"{}\"{shape}];", node.id, node.label());
        }
        for (from, to) in self.edges() {
            let _ = writeln!(out, "    \"{from}\" -> \"{to}\";");
        }
        out.push_str("}\n");
        out
    }

    pub fn write_dot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_dot()).map_err(|e| PipelineError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brain_loop_unrolled() {
        let g = PipelineGraph::anats_to_common(3).unwrap();
        let averages = g
            .nodes()
            .iter()
            .filter(|n| n.stage == Some(Stage::BrainAverage))
            .count();
        assert_eq!(averages, 3);
        // 2 terminals + extraction + 2 per iteration + 4 head stages
        assert_eq!(g.nodes().len(), 2 + 1 + 6 + 4);
    }

    #[test]
    fn test_rejects_out_of_range_iterations() {
        assert!(PipelineGraph::anats_to_common(0).is_err());
        assert!(PipelineGraph::anats_to_common(MAX_BRAIN_ITERATIONS + 1).is_err());
    }

    #[test]
    fn test_head_init_reads_final_brain_iteration() {
        let g = PipelineGraph::anats_to_common(2).unwrap();
        let deps: Vec<_> = g
            .dependencies_of("head_init")
            .into_iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(
            deps,
            vec!["images", "brain_average_iter2", "brain_affine_iter2", "head_mask"]
        );
    }

    #[test]
    fn test_topological_order_covers_every_node() {
        let g = PipelineGraph::anats_to_common(4).unwrap();
        let order = g.topological_order();
        assert_eq!(order.len(), g.nodes().len());
        assert_eq!(order.first().unwrap().id, "images");
        assert_eq!(order.last().unwrap().id, "registered");
    }

    #[test]
    fn test_dot_is_deterministic() {
        let a = PipelineGraph::anats_to_common(2).unwrap().to_dot();
        let b = PipelineGraph::anats_to_common(2).unwrap().to_dot();
        assert_eq!(a, b);
        assert!(a.starts_with("digraph anats_to_common {"));
        assert!(a.contains("\"brain_average_iter1\" -> \"brain_affine_iter1\";"));
        assert!(a.contains("\"images\" [label=\"images\", shape=folder];"));
    }

    #[test]
    fn test_write_dot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.dot");
        let g = PipelineGraph::anats_to_common(1).unwrap();
        g.write_dot(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), g.to_dot());
    }
}
