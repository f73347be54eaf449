use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::scheduler::{BatchScheduler, JobHandle, SubmitRequest};
use crate::stage::StageId;

/// Whatever executes one task of a stage; `index` is the array position.
pub trait TaskRunner: Sync {
    fn run_task(&self, stage: StageId, index: Option<usize>) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Succeeded,
    Failed { failed_tasks: usize },
    /// A dependency did not succeed, so the job never started.
    Blocked,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalJob {
    pub stage: StageId,
    pub state: JobState,
}

/// In-process stand-in for a batch system. Submissions arrive in dependency
/// order, so each job runs to completion inside `submit` and later jobs only
/// start when every dependency succeeded.
pub struct LocalScheduler<'a, R: TaskRunner> {
    runner: &'a R,
    jobs: Mutex<BTreeMap<JobHandle, LocalJob>>,
    counter: AtomicUsize,
}

impl<'a, R: TaskRunner> LocalScheduler<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self {
            runner,
            jobs: Mutex::new(BTreeMap::new()),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn state(&self, handle: &JobHandle) -> Option<JobState> {
        self.lock_jobs().get(handle).map(|job| job.state)
    }

    pub fn jobs(&self) -> Vec<(JobHandle, LocalJob)> {
        self.lock_jobs()
            .iter()
            .map(|(handle, job)| (handle.clone(), job.clone()))
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.lock_jobs()
            .values()
            .all(|job| job.state == JobState::Succeeded)
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<JobHandle, LocalJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_array(&self, stage: StageId, size: usize, cap: Option<usize>) -> usize {
        let workers = cap
            .or_else(|| std::thread::available_parallelism().ok().map(NonZeroUsize::get))
            .unwrap_or(1)
            .clamp(1, size.max(1));
        let next = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        if index >= size {
                            break;
                        }
                        if let Err(err) = self.runner.run_task(stage, Some(index)) {
                            error!(stage = %stage, index, error = %err, "array task failed");
                            failed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        failed.into_inner()
    }
}

impl<R: TaskRunner> BatchScheduler for LocalScheduler<'_, R> {
    fn submit(&self, request: &SubmitRequest) -> Result<JobHandle, PipelineError> {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = JobHandle::new(format!("local-{sequence}-{}", request.stage));

        let blocked_by = {
            let jobs = self.lock_jobs();
            request
                .dependencies
                .iter()
                .find(|dep| jobs.get(*dep).is_none_or(|job| job.state != JobState::Succeeded))
                .cloned()
        };

        let state = if let Some(dep) = blocked_by {
            warn!(stage = %request.stage, dependency = %dep, "dependency did not succeed; job not started");
            JobState::Blocked
        } else {
            let failed_tasks = match request.array_size {
                Some(size) => self.run_array(request.stage, size, request.max_concurrent),
                None => match self.runner.run_task(request.stage, None) {
                    Ok(()) => 0,
                    Err(err) => {
                        error!(stage = %request.stage, error = %err, "task failed");
                        1
                    }
                },
            };
            if failed_tasks == 0 {
                info!(stage = %request.stage, job = %handle, "job succeeded");
                JobState::Succeeded
            } else {
                JobState::Failed { failed_tasks }
            }
        };

        self.lock_jobs().insert(
            handle.clone(),
            LocalJob {
                stage: request.stage,
                state,
            },
        );
        Ok(handle)
    }
}
