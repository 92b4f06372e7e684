//! Section dependency graph.
//!
//! A query template that mentions `{{section:<id>}}` makes its section
//! depend on `<id>`. The graph has one node per section and an edge from
//! each dependency to its dependent, so a topological order drafts every
//! referenced section before the sections that quote it.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

use crate::models::SectionSpec;
use crate::retrieve::template_dependencies;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("duplicate section id: '{0}'")]
    Duplicate(String),

    #[error("section '{section}' references unknown section '{reference}'")]
    UnknownReference { section: String, reference: String },

    #[error("section query templates form a dependency cycle through '{0}'")]
    Cycle(String),
}

pub struct SectionGraph<'a> {
    graph: DiGraph<&'a SectionSpec, ()>,
}

impl<'a> SectionGraph<'a> {
    pub fn build(sections: &'a [SectionSpec]) -> Result<Self, PlanError> {
        let mut graph = DiGraph::new();
        let mut by_id: HashMap<&str, NodeIndex> = HashMap::new();
        for spec in sections {
            let idx = graph.add_node(spec);
            if by_id.insert(spec.id.as_str(), idx).is_some() {
                return Err(PlanError::Duplicate(spec.id.clone()));
            }
        }

        for spec in sections {
            let dependent = by_id[spec.id.as_str()];
            for reference in template_dependencies(&spec.query) {
                let Some(&dependency) = by_id.get(reference.as_str()) else {
                    return Err(PlanError::UnknownReference {
                        section: spec.id.clone(),
                        reference,
                    });
                };
                graph.add_edge(dependency, dependent, ());
            }
        }

        Ok(Self { graph })
    }

    fn order(&self) -> Result<Vec<NodeIndex>, PlanError> {
        toposort(&self.graph, None)
            .map_err(|cycle| PlanError::Cycle(self.graph[cycle.node_id()].id.clone()))
    }

    /// Reject cyclic templates.
    pub fn check(&self) -> Result<(), PlanError> {
        self.order().map(|_| ())
    }

    /// Group sections into waves: a section sits one wave after its deepest
    /// dependency. Each wave is sorted by `order`, then id.
    pub fn waves(&self) -> Result<Vec<Vec<SectionSpec>>, PlanError> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let mut waves: Vec<Vec<SectionSpec>> = Vec::new();
        for node in self.order()? {
            let d = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|dep| depth.get(&dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node, d);
            if waves.len() <= d {
                waves.resize_with(d + 1, Vec::new);
            }
            waves[d].push(self.graph[node].clone());
        }
        for wave in &mut waves {
            wave.sort_by(|a, b| (a.order, &a.id).cmp(&(b.order, &b.id)));
        }
        Ok(waves)
    }
}
