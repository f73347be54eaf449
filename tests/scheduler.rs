use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;

use kira_ko_pipeline::config::SchedulerConfig;
use kira_ko_pipeline::domain::{Sample, TaxonLevel};
use kira_ko_pipeline::error::PipelineError;
use kira_ko_pipeline::local::{JobState, LocalScheduler, TaskRunner};
use kira_ko_pipeline::planner::{ExecutionPlan, PlanSettings, plan};
use kira_ko_pipeline::scheduler::{
    BatchScheduler, JobHandle, SlurmScheduler, SubmitRequest, submit_plan,
};
use kira_ko_pipeline::stage::{StageGraph, StageId, StageMode};
use kira_ko_pipeline::store::ArtifactStore;

fn build_plan(ids: &[&str], modes: Vec<(StageId, StageMode)>) -> (tempfile::TempDir, ExecutionPlan) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = ArtifactStore::new(root, vec![TaxonLevel::Genus]);
    let samples = ids
        .iter()
        .map(|id| Sample {
            id: id.parse().unwrap(),
            read1: Utf8PathBuf::from(format!("{id}_1.fastq.gz")),
            read2: Utf8PathBuf::from(format!("{id}_2.fastq.gz")),
        })
        .collect::<Vec<_>>();
    let settings = PlanSettings {
        auto_resume: true,
        modes,
    };
    let plan = plan(&StageGraph::standard(), &store, &samples, &settings).unwrap();
    (temp, plan)
}

#[derive(Default)]
struct RecordingScheduler {
    requests: RefCell<Vec<SubmitRequest>>,
}

impl BatchScheduler for RecordingScheduler {
    fn submit(&self, request: &SubmitRequest) -> Result<JobHandle, PipelineError> {
        self.requests.borrow_mut().push(request.clone());
        Ok(JobHandle::new(format!("job-{}", request.stage)))
    }
}

fn handle(stage: StageId) -> JobHandle {
    JobHandle::new(format!("job-{stage}"))
}

#[test]
fn submissions_follow_plan_edges() {
    let (_temp, plan) = build_plan(&["S1", "S2", "S3"], Vec::new());
    let scheduler = RecordingScheduler::default();

    let submissions = submit_plan(&plan, &scheduler, Some(2)).unwrap();
    assert_eq!(submissions.len(), 7);

    let requests = scheduler.requests.borrow();
    let by_stage = |stage: StageId| requests.iter().find(|r| r.stage == stage).unwrap();

    let profile = by_stage(StageId::Profile);
    assert_eq!(profile.array_size, Some(3));
    assert_eq!(profile.max_concurrent, Some(2));
    assert!(profile.dependencies.is_empty());

    let groups = by_stage(StageId::GroupSummary);
    assert_eq!(groups.array_size, None);
    assert_eq!(groups.max_concurrent, None);
    assert_eq!(groups.dependencies, vec![handle(StageId::Profile)]);

    let normalize = by_stage(StageId::Normalize);
    assert_eq!(
        normalize.dependencies,
        vec![handle(StageId::SumHits), handle(StageId::GenomeEquivalents)]
    );
}

#[test]
fn skipped_predecessor_emits_no_edge() {
    let (_temp, plan) = build_plan(
        &["S1"],
        vec![
            (StageId::Profile, StageMode::Skip),
            (StageId::GroupSummary, StageMode::Skip),
            (StageId::GenomeEquivalents, StageMode::Skip),
        ],
    );
    let scheduler = RecordingScheduler::default();

    let submissions = submit_plan(&plan, &scheduler, None).unwrap();
    let stages = submissions.iter().map(|s| s.stage).collect::<Vec<_>>();
    assert_eq!(
        stages,
        vec![
            StageId::Align,
            StageId::ExtractHits,
            StageId::SumHits,
            StageId::Normalize
        ]
    );
    assert!(submissions[0].dependencies.is_empty());
    assert_eq!(submissions[3].dependencies, vec![handle(StageId::SumHits)]);
}

#[test]
fn sbatch_arguments_for_array_and_singleton() {
    let settings = SchedulerConfig {
        partition: Some("short".to_string()),
        cpus: Some(16),
        ..SchedulerConfig::default()
    };
    let slurm = SlurmScheduler::new(
        Utf8PathBuf::from("/opt/kira/kira-kp"),
        Utf8PathBuf::from("/work/kira-kp.json"),
        Utf8PathBuf::from("/work/out/logs"),
        settings,
    );

    let array = slurm.sbatch_args(&SubmitRequest {
        stage: StageId::Align,
        array_size: Some(12),
        dependencies: vec![JobHandle::new("101"), JobHandle::new("102")],
        max_concurrent: Some(4),
    });
    assert!(array.contains(&"--parsable".to_string()));
    assert!(array.contains(&"--array=0-11%4".to_string()));
    assert!(array.contains(&"--dependency=afterok:101:102".to_string()));
    assert!(array.contains(&"--kill-on-invalid-dep=yes".to_string()));
    assert!(array.contains(&"--partition=short".to_string()));
    assert!(array.contains(&"--cpus-per-task=16".to_string()));
    assert!(array.contains(&"--output=/work/out/logs/align_%A_%a.log".to_string()));
    assert_eq!(
        array.last().unwrap(),
        "/opt/kira/kira-kp task --config /work/kira-kp.json --stage align"
    );

    let single = slurm.sbatch_args(&SubmitRequest {
        stage: StageId::Normalize,
        array_size: None,
        dependencies: Vec::new(),
        max_concurrent: None,
    });
    assert!(!single.iter().any(|arg| arg.starts_with("--array")));
    assert!(!single.iter().any(|arg| arg.starts_with("--dependency")));
}

/// Fails the listed (stage, index) tasks and records every call.
#[derive(Default)]
struct ScriptedRunner {
    failing: Vec<(StageId, Option<usize>)>,
    calls: Mutex<Vec<(StageId, Option<usize>)>>,
}

impl TaskRunner for ScriptedRunner {
    fn run_task(&self, stage: StageId, index: Option<usize>) -> Result<(), PipelineError> {
        self.calls.lock().unwrap().push((stage, index));
        if self.failing.contains(&(stage, index)) {
            return Err(PipelineError::ToolFailed {
                tool: stage.to_string(),
                message: "exit status 1".to_string(),
            });
        }
        Ok(())
    }
}

#[test]
fn failed_unit_blocks_dependent_stages() {
    let (_temp, plan) = build_plan(&["S1", "S2", "S3"], Vec::new());
    let runner = ScriptedRunner {
        failing: vec![(StageId::Align, Some(1))],
        ..ScriptedRunner::default()
    };
    let scheduler = LocalScheduler::new(&runner);

    let submissions = submit_plan(&plan, &scheduler, Some(2)).unwrap();
    let state = |stage: StageId| {
        let submission = submissions.iter().find(|s| s.stage == stage).unwrap();
        scheduler.state(&submission.handle).unwrap()
    };

    let calls = runner.calls.lock().unwrap().clone();
    let align_indices = calls
        .iter()
        .filter(|(stage, _)| *stage == StageId::Align)
        .filter_map(|(_, index)| *index)
        .collect::<BTreeSet<_>>();
    assert_eq!(align_indices, BTreeSet::from([0, 1, 2]));
    for stage in [
        StageId::ExtractHits,
        StageId::SumHits,
        StageId::GenomeEquivalents,
        StageId::Normalize,
    ] {
        assert!(calls.iter().all(|(called, _)| *called != stage));
        assert_eq!(state(stage), JobState::Blocked);
    }

    assert_eq!(state(StageId::Align), JobState::Failed { failed_tasks: 1 });
    assert_eq!(state(StageId::GroupSummary), JobState::Succeeded);
    assert!(!scheduler.all_succeeded());
}

struct SlowRunner {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl TaskRunner for SlowRunner {
    fn run_task(&self, _stage: StageId, _index: Option<usize>) -> Result<(), PipelineError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn concurrency_cap_limits_parallel_units() {
    let runner = SlowRunner {
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    };
    let scheduler = LocalScheduler::new(&runner);
    let handle = scheduler
        .submit(&SubmitRequest {
            stage: StageId::Align,
            array_size: Some(8),
            dependencies: Vec::new(),
            max_concurrent: Some(2),
        })
        .unwrap();

    assert_eq!(scheduler.state(&handle), Some(JobState::Succeeded));
    assert!(runner.peak.load(Ordering::SeqCst) <= 2);
}
