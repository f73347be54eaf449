use std::collections::BTreeMap;
use std::fmt;
use std::process::Command;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::error::PipelineError;
use crate::planner::ExecutionPlan;
use crate::stage::{Cardinality, StageId};
use crate::tools::find_in_path;

/// Opaque reference returned by a scheduler, only used to wire dependencies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub stage: StageId,
    /// `Some(n)` fans out into `n` indexed tasks; `None` is a single task.
    pub array_size: Option<usize>,
    pub dependencies: Vec<JobHandle>,
    pub max_concurrent: Option<usize>,
}

/// Backend offering submission, array fan-out and run-after-success edges.
pub trait BatchScheduler {
    fn submit(&self, request: &SubmitRequest) -> Result<JobHandle, PipelineError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub stage: StageId,
    pub handle: JobHandle,
    pub array_size: Option<usize>,
    pub dependencies: Vec<JobHandle>,
}

/// One submission per stage planned to run, in plan order. Skipped
/// predecessors contribute no dependency edge.
pub fn submit_plan(
    plan: &ExecutionPlan,
    scheduler: &dyn BatchScheduler,
    max_concurrent: Option<usize>,
) -> Result<Vec<Submission>, PipelineError> {
    let mut handles: BTreeMap<StageId, JobHandle> = BTreeMap::new();
    let mut submissions = Vec::new();

    for planned in plan.runnable() {
        let array_size = match planned.cardinality {
            Cardinality::PerSample => Some(plan.sample_count),
            Cardinality::Singleton => None,
        };
        let dependencies = planned
            .wait_on
            .iter()
            .filter_map(|pred| handles.get(pred).cloned())
            .collect::<Vec<_>>();
        let request = SubmitRequest {
            stage: planned.stage,
            array_size,
            dependencies: dependencies.clone(),
            max_concurrent: array_size.and(max_concurrent),
        };

        let handle = scheduler.submit(&request)?;
        info!(stage = %planned.stage, job = %handle, ?array_size, "stage submitted");
        handles.insert(planned.stage, handle.clone());
        submissions.push(Submission {
            stage: planned.stage,
            handle,
            array_size,
            dependencies,
        });
    }

    if submissions.is_empty() {
        info!("every stage is satisfied or skipped; nothing submitted");
    }
    Ok(submissions)
}

/// Submits through `sbatch --parsable`. Every job re-enters this binary's
/// `task` subcommand with the same config file.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    executable: Utf8PathBuf,
    config_path: Utf8PathBuf,
    log_dir: Utf8PathBuf,
    settings: SchedulerConfig,
}

impl SlurmScheduler {
    pub fn new(
        executable: Utf8PathBuf,
        config_path: Utf8PathBuf,
        log_dir: Utf8PathBuf,
        settings: SchedulerConfig,
    ) -> Self {
        Self {
            executable,
            config_path,
            log_dir,
            settings,
        }
    }

    pub fn sbatch_args(&self, request: &SubmitRequest) -> Vec<String> {
        let stage = request.stage.as_str();
        let mut args = vec![
            "--parsable".to_string(),
            format!("--job-name=kira-kp-{stage}"),
        ];

        match request.array_size {
            Some(size) => {
                let last = size.saturating_sub(1);
                let range = match request.max_concurrent {
                    Some(cap) => format!("--array=0-{last}%{cap}"),
                    None => format!("--array=0-{last}"),
                };
                args.push(range);
                args.push(format!("--output={}/{stage}_%A_%a.log", self.log_dir));
            }
            None => args.push(format!("--output={}/{stage}_%j.log", self.log_dir)),
        }

        if !request.dependencies.is_empty() {
            let ids = request
                .dependencies
                .iter()
                .map(JobHandle::as_str)
                .collect::<Vec<_>>()
                .join(":");
            args.push(format!("--dependency=afterok:{ids}"));
            args.push("--kill-on-invalid-dep=yes".to_string());
        }

        if let Some(partition) = &self.settings.partition {
            args.push(format!("--partition={partition}"));
        }
        if let Some(account) = &self.settings.account {
            args.push(format!("--account={account}"));
        }
        if let Some(time) = &self.settings.time {
            args.push(format!("--time={time}"));
        }
        if let Some(memory) = &self.settings.memory {
            args.push(format!("--mem={memory}"));
        }
        if let Some(cpus) = self.settings.cpus {
            args.push(format!("--cpus-per-task={cpus}"));
        }
        args.extend(self.settings.extra_args.iter().cloned());

        args.push("--wrap".to_string());
        args.push(format!(
            "{} task --config {} --stage {stage}",
            shell_quote(self.executable.as_str()),
            shell_quote(self.config_path.as_str()),
        ));
        args
    }
}

impl BatchScheduler for SlurmScheduler {
    fn submit(&self, request: &SubmitRequest) -> Result<JobHandle, PipelineError> {
        let sbatch =
            find_in_path("sbatch").ok_or_else(|| PipelineError::MissingTool("sbatch".to_string()))?;
        let output = Command::new(sbatch)
            .args(self.sbatch_args(request))
            .output()
            .map_err(|err| PipelineError::Scheduler(err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(stage = %request.stage, "sbatch rejected submission");
            return Err(PipelineError::Scheduler(stderr));
        }
        parse_job_id(&String::from_utf8_lossy(&output.stdout))
    }
}

/// `--parsable` prints `jobid` or `jobid;cluster`.
pub fn parse_job_id(stdout: &str) -> Result<JobHandle, PipelineError> {
    let line = stdout.lines().map(str::trim).find(|line| !line.is_empty());
    let id = line.and_then(|line| line.split(';').next()).unwrap_or_default();
    if id.is_empty() || !id.chars().all(|ch| ch.is_ascii_digit() || ch == '_') {
        return Err(PipelineError::Scheduler(format!(
            "unexpected sbatch output `{}`",
            stdout.trim()
        )));
    }
    Ok(JobHandle::new(id))
}

fn shell_quote(value: &str) -> String {
    let plain = value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '.' | '_' | '-' | ':' | '='));
    if plain && !value.is_empty() {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parsable_output_with_cluster() {
        assert_eq!(parse_job_id("4242;cluster\n").unwrap().as_str(), "4242");
        assert_eq!(parse_job_id("17\n").unwrap().as_str(), "17");
        assert_matches!(parse_job_id("Submitted batch job"), Err(PipelineError::Scheduler(_)));
    }

    #[test]
    fn quoting_only_when_needed() {
        assert_eq!(shell_quote("/opt/bin/kira-kp"), "/opt/bin/kira-kp");
        assert_eq!(shell_quote("my config.json"), "'my config.json'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
