use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::ResolvedConfig;
use crate::domain::Sample;
use crate::error::PipelineError;
use crate::stage::{Cardinality, StageGraph, StageId, StageMode};
use crate::store::{ArtifactStore, is_complete};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Run,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DecisionReason {
    ForcedSkip,
    ForcedRun,
    ResumeDisabled,
    Satisfied,
    Incomplete { complete: usize, total: usize },
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionReason::ForcedSkip => write!(f, "forced skip"),
            DecisionReason::ForcedRun => write!(f, "forced run"),
            DecisionReason::ResumeDisabled => write!(f, "auto-resume off"),
            DecisionReason::Satisfied => write!(f, "outputs complete"),
            DecisionReason::Incomplete { complete, total } => {
                write!(f, "{complete}/{total} complete")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStage {
    pub stage: StageId,
    pub cardinality: Cardinality,
    pub decision: Decision,
    pub reason: DecisionReason,
    /// Predecessors that are themselves scheduled; skipped ones impose no wait.
    pub wait_on: Vec<StageId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub sample_count: usize,
    pub stages: Vec<PlannedStage>,
}

impl ExecutionPlan {
    pub fn get(&self, stage: StageId) -> Option<&PlannedStage> {
        self.stages.iter().find(|planned| planned.stage == stage)
    }

    pub fn decision(&self, stage: StageId) -> Option<Decision> {
        self.get(stage).map(|planned| planned.decision)
    }

    pub fn runnable(&self) -> impl Iterator<Item = &PlannedStage> {
        self.stages
            .iter()
            .filter(|planned| planned.decision == Decision::Run)
    }
}

/// Inputs the planner needs; kept apart from `ResolvedConfig` so it can be
/// driven directly.
#[derive(Debug, Clone)]
pub struct PlanSettings {
    pub auto_resume: bool,
    pub modes: Vec<(StageId, StageMode)>,
}

impl PlanSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            auto_resume: config.auto_resume,
            modes: StageId::ALL
                .into_iter()
                .map(|stage| (stage, config.stage_mode(stage)))
                .collect(),
        }
    }

    fn mode(&self, stage: StageId) -> StageMode {
        self.modes
            .iter()
            .find(|(id, _)| *id == stage)
            .map(|(_, mode)| *mode)
            .unwrap_or_default()
    }
}

/// Decides run/skip per stage from what is already on disk. Only reads the
/// store, so replanning an unchanged tree gives the same answer.
pub fn plan(
    graph: &StageGraph,
    store: &ArtifactStore,
    samples: &[Sample],
    settings: &PlanSettings,
) -> Result<ExecutionPlan, PipelineError> {
    if samples.is_empty() {
        return Err(PipelineError::NoSamples(store.root().to_path_buf()));
    }

    let order = graph.topological_order()?;
    let mut stages: Vec<PlannedStage> = Vec::with_capacity(order.len());
    for stage in order {
        let cardinality = graph.cardinality(stage);
        let (decision, reason) = match settings.mode(stage) {
            StageMode::Skip => (Decision::Skip, DecisionReason::ForcedSkip),
            StageMode::Run => (Decision::Run, DecisionReason::ForcedRun),
            StageMode::Auto if !settings.auto_resume => {
                (Decision::Run, DecisionReason::ResumeDisabled)
            }
            StageMode::Auto => {
                let (complete, total) = completion(store, stage, cardinality, samples);
                if complete == total {
                    (Decision::Skip, DecisionReason::Satisfied)
                } else {
                    (Decision::Run, DecisionReason::Incomplete { complete, total })
                }
            }
        };

        let wait_on = graph
            .node(stage)
            .map(|node| {
                node.predecessors
                    .iter()
                    .copied()
                    .filter(|pred| {
                        stages
                            .iter()
                            .any(|done| done.stage == *pred && done.decision == Decision::Run)
                    })
                    .collect()
            })
            .unwrap_or_default();

        debug!(stage = %stage, ?decision, ?reason, "stage planned");
        stages.push(PlannedStage {
            stage,
            cardinality,
            decision,
            reason,
            wait_on,
        });
    }

    let plan = ExecutionPlan {
        sample_count: samples.len(),
        stages,
    };
    info!(
        samples = plan.sample_count,
        run = plan.runnable().count(),
        "execution planned"
    );
    Ok(plan)
}

/// (complete units, total units) for one stage.
pub fn completion(
    store: &ArtifactStore,
    stage: StageId,
    cardinality: Cardinality,
    samples: &[Sample],
) -> (usize, usize) {
    match cardinality {
        Cardinality::PerSample => {
            let complete = samples
                .iter()
                .filter(|sample| store.unit_complete(stage, &sample.id))
                .count();
            (complete, samples.len())
        }
        Cardinality::Singleton => {
            let done = store
                .singleton_output(stage)
                .is_some_and(|path| is_complete(&path));
            (usize::from(done), 1)
        }
    }
}
