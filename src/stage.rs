use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    Profile,
    GroupSummary,
    Align,
    ExtractHits,
    SumHits,
    GenomeEquivalents,
    Normalize,
}

impl StageId {
    pub const ALL: [StageId; 7] = [
        StageId::Profile,
        StageId::GroupSummary,
        StageId::Align,
        StageId::ExtractHits,
        StageId::SumHits,
        StageId::GenomeEquivalents,
        StageId::Normalize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Profile => "profile",
            StageId::GroupSummary => "group-summary",
            StageId::Align => "align",
            StageId::ExtractHits => "extract-hits",
            StageId::SumHits => "sum-hits",
            StageId::GenomeEquivalents => "genome-equivalents",
            StageId::Normalize => "normalize",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StageId {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        StageId::ALL
            .into_iter()
            .find(|stage| stage.as_str() == trimmed)
            .ok_or_else(|| PipelineError::InvalidStage(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cardinality {
    PerSample,
    Singleton,
}

/// Operator intent for one stage, resolved into run/skip by the planner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    #[default]
    Auto,
    Run,
    Skip,
}

#[derive(Debug, Clone)]
pub struct StageNode {
    pub id: StageId,
    pub predecessors: Vec<StageId>,
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone)]
pub struct StageGraph {
    nodes: Vec<StageNode>,
}

impl StageGraph {
    /// The fixed seven-stage workflow.
    pub fn standard() -> Self {
        use Cardinality::{PerSample, Singleton};
        let node = |id, predecessors: &[StageId], cardinality| StageNode {
            id,
            predecessors: predecessors.to_vec(),
            cardinality,
        };
        Self {
            nodes: vec![
                node(StageId::Profile, &[], PerSample),
                node(StageId::GroupSummary, &[StageId::Profile], Singleton),
                node(StageId::Align, &[StageId::Profile], PerSample),
                node(StageId::ExtractHits, &[StageId::Align], PerSample),
                node(StageId::SumHits, &[StageId::ExtractHits], PerSample),
                node(StageId::GenomeEquivalents, &[StageId::SumHits], Singleton),
                node(
                    StageId::Normalize,
                    &[StageId::SumHits, StageId::GenomeEquivalents],
                    Singleton,
                ),
            ],
        }
    }

    pub fn from_nodes(nodes: Vec<StageNode>) -> Self {
        Self { nodes }
    }

    pub fn node(&self, id: StageId) -> Option<&StageNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn cardinality(&self, id: StageId) -> Cardinality {
        self.node(id)
            .map(|node| node.cardinality)
            .unwrap_or(Cardinality::Singleton)
    }

    /// Kahn's algorithm; ties are broken by declaration order so the result is
    /// stable across invocations.
    pub fn topological_order(&self) -> Result<Vec<StageId>, PipelineError> {
        let mut indegree: BTreeMap<StageId, usize> = self
            .nodes
            .iter()
            .map(|node| (node.id, node.predecessors.len()))
            .collect();
        let mut ready: VecDeque<StageId> = self
            .nodes
            .iter()
            .filter(|node| node.predecessors.is_empty())
            .map(|node| node.id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for node in &self.nodes {
                if !node.predecessors.contains(&id) {
                    continue;
                }
                if let Some(count) = indegree.get_mut(&node.id) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(node.id);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .find(|node| !order.contains(&node.id))
                .map(|node| node.id.to_string())
                .unwrap_or_default();
            return Err(PipelineError::StageCycle(stuck));
        }
        Ok(order)
    }
}
