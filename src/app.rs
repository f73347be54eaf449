use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::aggregate::{
    self, estimate_genome_equivalent, read_genome_equivalents, read_summed,
    render_genome_equivalents,
};
use crate::config::ResolvedConfig;
use crate::discovery::discover_samples;
use crate::domain::{Sample, SampleId};
use crate::error::PipelineError;
use crate::executor::{UnitExecutor, UnitOutcome, UnitTask};
use crate::groups::summarize_groups;
use crate::hits::{self, KoMapping};
use crate::local::TaskRunner;
use crate::planner::{self, ExecutionPlan, PlanSettings};
use crate::scheduler::{BatchScheduler, Submission, submit_plan};
use crate::stage::{Cardinality, StageGraph, StageId};
use crate::store::ArtifactStore;
use crate::tools::ExternalTools;

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: String,
    pub outcome: UnitOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub stage: StageId,
    pub sample: Option<SampleId>,
    pub units: Vec<UnitReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResult {
    pub plan: ExecutionPlan,
    pub submissions: Vec<Submission>,
}

pub struct App<T: ExternalTools> {
    config: ResolvedConfig,
    store: ArtifactStore,
    graph: StageGraph,
    samples: Vec<Sample>,
    tools: T,
}

impl<T: ExternalTools> App<T> {
    /// Discovers samples up front; an empty input directory is fatal here.
    pub fn new(config: ResolvedConfig, tools: T) -> Result<Self, PipelineError> {
        let samples = discover_samples(&config.input_dir)?;
        let store = ArtifactStore::new(config.output_dir.clone(), config.levels.clone());
        Ok(Self {
            config,
            store,
            graph: StageGraph::standard(),
            samples,
            tools,
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn plan(&self) -> Result<ExecutionPlan, PipelineError> {
        planner::plan(
            &self.graph,
            &self.store,
            &self.samples,
            &PlanSettings::from_config(&self.config),
        )
    }

    /// Fails before anything is submitted when a stage that will run lacks
    /// its reference database.
    pub fn check_requirements(&self, plan: &ExecutionPlan) -> Result<(), PipelineError> {
        for planned in plan.runnable() {
            self.config.require_database(planned.stage)?;
        }
        Ok(())
    }

    pub fn submit(
        &self,
        plan: ExecutionPlan,
        scheduler: &dyn BatchScheduler,
    ) -> Result<SubmitResult, PipelineError> {
        self.check_requirements(&plan)?;
        fs::create_dir_all(self.config.log_dir.as_std_path()).map_err(|err| {
            PipelineError::Filesystem(format!("create {}: {err}", self.config.log_dir))
        })?;
        let submissions = submit_plan(&plan, scheduler, self.config.max_concurrent)?;
        Ok(SubmitResult { plan, submissions })
    }

    /// Runs one task of a stage: the `index`-th sample for per-sample stages,
    /// the single aggregate step otherwise.
    pub fn execute_task(
        &self,
        stage: StageId,
        index: Option<usize>,
    ) -> Result<TaskReport, PipelineError> {
        match self.graph.cardinality(stage) {
            Cardinality::PerSample => {
                let index = index.ok_or_else(|| PipelineError::MissingIndex(stage.to_string()))?;
                let sample = self.samples.get(index).ok_or(PipelineError::IndexOutOfRange {
                    index,
                    count: self.samples.len(),
                })?;
                let units = match stage {
                    StageId::Profile => self.profile(sample)?,
                    StageId::Align => vec![self.align(sample)?],
                    StageId::ExtractHits => vec![self.extract_hits(sample)?],
                    StageId::SumHits => vec![self.sum_hits(sample)?],
                    other => return Err(PipelineError::InvalidStage(other.to_string())),
                };
                Ok(TaskReport {
                    stage,
                    sample: Some(sample.id.clone()),
                    units,
                })
            }
            Cardinality::Singleton => {
                if index.is_some_and(|index| index > 0) {
                    warn!(stage = %stage, "array index ignored for singleton stage");
                }
                let unit = match stage {
                    StageId::GroupSummary => UnitReport {
                        unit: stage.to_string(),
                        outcome: summarize_groups(
                            &self.store,
                            &self.samples,
                            &self.config.groups,
                            &self.tools,
                        )?,
                    },
                    StageId::GenomeEquivalents => self.genome_equivalents()?,
                    StageId::Normalize => self.normalize()?,
                    other => return Err(PipelineError::InvalidStage(other.to_string())),
                };
                Ok(TaskReport {
                    stage,
                    sample: None,
                    units: vec![unit],
                })
            }
        }
    }

    /// Trim, classify, then one abundance summary per level. Stops early when
    /// another worker holds a step.
    fn profile(&self, sample: &Sample) -> Result<Vec<UnitReport>, PipelineError> {
        let id = &sample.id;
        let (trimmed1, trimmed2) = self.store.trimmed_reads(id);
        let report = self.store.profile_report(id);
        let mut units = Vec::new();

        let trim = UnitTask::new(
            format!("trim:{id}"),
            vec![sample.read1.clone(), sample.read2.clone()],
            vec![trimmed1.clone(), trimmed2.clone()],
        );
        let outcome = UnitExecutor::run(&trim, &|temps: &[Utf8PathBuf]| {
            self.tools.trim(
                (sample.read1.as_path(), sample.read2.as_path()),
                (temps[0].as_path(), temps[1].as_path()),
            )
        })?;
        units.push(report_for(&trim, outcome));
        if outcome == UnitOutcome::LockedElsewhere {
            return Ok(units);
        }

        let classify = UnitTask::new(
            format!("classify:{id}"),
            vec![trimmed1.clone(), trimmed2.clone()],
            vec![report.clone()],
        );
        let outcome = UnitExecutor::run(&classify, &|temps: &[Utf8PathBuf]| {
            self.tools
                .classify((trimmed1.as_path(), trimmed2.as_path()), &temps[0])
        })?;
        units.push(report_for(&classify, outcome));
        if outcome == UnitOutcome::LockedElsewhere {
            return Ok(units);
        }

        for level in self.store.levels().iter().copied() {
            let summary = UnitTask::new(
                format!("level-summary:{id}:{level}"),
                vec![report.clone()],
                vec![self.store.level_summary(id, level)],
            );
            let outcome = UnitExecutor::run(&summary, &|temps: &[Utf8PathBuf]| {
                self.tools.summarize_level(&report, level, &temps[0])
            })?;
            units.push(report_for(&summary, outcome));
        }
        Ok(units)
    }

    fn align(&self, sample: &Sample) -> Result<UnitReport, PipelineError> {
        let (trimmed1, trimmed2) = self.store.trimmed_reads(&sample.id);
        let task = UnitTask::new(
            format!("align:{}", sample.id),
            vec![trimmed1.clone(), trimmed2.clone()],
            vec![self.store.alignment(&sample.id)],
        );
        let outcome = UnitExecutor::run(&task, &|temps: &[Utf8PathBuf]| {
            self.tools
                .align((trimmed1.as_path(), trimmed2.as_path()), &temps[0])
        })?;
        Ok(report_for(&task, outcome))
    }

    fn extract_hits(&self, sample: &Sample) -> Result<UnitReport, PipelineError> {
        let alignment = self.store.alignment(&sample.id);
        let task = UnitTask::new(
            format!("extract-hits:{}", sample.id),
            vec![alignment.clone()],
            vec![self.store.extracted_hits(&sample.id)],
        );
        let outcome = UnitExecutor::run(&task, &|temps: &[Utf8PathBuf]| {
            let annotations = self.config.databases.kegg_annotations.as_ref().ok_or_else(|| {
                PipelineError::MissingConfigValue("databases.kegg_annotations".to_string())
            })?;
            let mapping = KoMapping::load(annotations)?;
            hits::extract_to(&alignment, &mapping, &temps[0]).map(|_| ())
        })?;
        Ok(report_for(&task, outcome))
    }

    fn sum_hits(&self, sample: &Sample) -> Result<UnitReport, PipelineError> {
        let extracted = self.store.extracted_hits(&sample.id);
        let task = UnitTask::new(
            format!("sum-hits:{}", sample.id),
            vec![extracted.clone()],
            vec![self.store.summed_hits(&sample.id)],
        );
        let outcome = UnitExecutor::run(&task, &|temps: &[Utf8PathBuf]| {
            hits::sum_to(&extracted, &temps[0]).map(|_| ())
        })?;
        Ok(report_for(&task, outcome))
    }

    fn summed_inputs(&self) -> Vec<Utf8PathBuf> {
        self.samples
            .iter()
            .map(|sample| self.store.summed_hits(&sample.id))
            .collect()
    }

    fn genome_equivalents(&self) -> Result<UnitReport, PipelineError> {
        let task = UnitTask::new(
            StageId::GenomeEquivalents.as_str(),
            self.summed_inputs(),
            vec![self.store.genome_equivalents()],
        );
        let outcome = UnitExecutor::run(&task, &|temps: &[Utf8PathBuf]| {
            let mut rows = Vec::with_capacity(self.samples.len());
            for sample in &self.samples {
                let counts = read_summed(&self.store.summed_hits(&sample.id))?;
                let estimate = estimate_genome_equivalent(&sample.id, &counts);
                if estimate.num_genomes.is_none() {
                    warn!(sample = %sample.id, "no single-copy marker KOs; genome equivalent undefined");
                }
                rows.push(estimate);
            }
            write_text(&temps[0], &render_genome_equivalents(&rows))
        })?;
        Ok(report_for(&task, outcome))
    }

    fn normalize(&self) -> Result<UnitReport, PipelineError> {
        let mut inputs = self.summed_inputs();
        inputs.push(self.store.genome_equivalents());
        let task = UnitTask::new(
            StageId::Normalize.as_str(),
            inputs,
            vec![self.store.feature_table()],
        );
        let outcome = UnitExecutor::run(&task, &|temps: &[Utf8PathBuf]| {
            let divisors = read_genome_equivalents(&self.store.genome_equivalents())?;
            let tables = self
                .samples
                .iter()
                .map(|sample| {
                    read_summed(&self.store.summed_hits(&sample.id))
                        .map(|counts| (sample.id.clone(), counts))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let table = aggregate::normalize(&tables, &divisors)?;
            write_text(&temps[0], &table.to_tsv())
        })?;
        Ok(report_for(&task, outcome))
    }
}

impl<T: ExternalTools> TaskRunner for App<T> {
    fn run_task(&self, stage: StageId, index: Option<usize>) -> Result<(), PipelineError> {
        let report = self.execute_task(stage, index)?;
        info!(stage = %stage, units = report.units.len(), "task done");
        Ok(())
    }
}

fn report_for(task: &UnitTask, outcome: UnitOutcome) -> UnitReport {
    UnitReport {
        unit: task.label.clone(),
        outcome,
    }
}

fn write_text(path: &Utf8Path, content: &str) -> Result<(), PipelineError> {
    fs::write(path.as_std_path(), content)
        .map_err(|err| PipelineError::Filesystem(format!("write {path}: {err}")))
}
