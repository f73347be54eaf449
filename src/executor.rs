use std::fs::{self, File, OpenOptions, TryLockError};
use std::io;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{error, info};

use crate::error::PipelineError;
use crate::fs_util::{ensure_parent, remove_if_exists};
use crate::store::{is_complete, lock_path, temp_path};

/// Work that fills the temp paths handed to it, in the same order as the
/// task's declared outputs.
pub trait UnitTool {
    fn run(&self, temp_outputs: &[Utf8PathBuf]) -> Result<(), PipelineError>;
}

impl<F> UnitTool for F
where
    F: Fn(&[Utf8PathBuf]) -> Result<(), PipelineError>,
{
    fn run(&self, temp_outputs: &[Utf8PathBuf]) -> Result<(), PipelineError> {
        self(temp_outputs)
    }
}

#[derive(Debug, Clone)]
pub struct UnitTask {
    pub label: String,
    pub inputs: Vec<Utf8PathBuf>,
    pub outputs: Vec<Utf8PathBuf>,
}

impl UnitTask {
    pub fn new(label: impl Into<String>, inputs: Vec<Utf8PathBuf>, outputs: Vec<Utf8PathBuf>) -> Self {
        Self {
            label: label.into(),
            inputs,
            outputs,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.outputs.is_empty() && self.outputs.iter().all(|path| is_complete(path))
    }

    fn lock_target(&self) -> Option<&Utf8PathBuf> {
        self.outputs.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitOutcome {
    Completed,
    AlreadyComplete,
    LockedElsewhere,
}

impl UnitOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitOutcome::Completed => "complete",
            UnitOutcome::AlreadyComplete => "already-complete",
            UnitOutcome::LockedElsewhere => "locked-elsewhere",
        }
    }
}

pub struct UnitExecutor;

impl UnitExecutor {
    /// Produces the task's outputs at most once. Temp files are renamed into
    /// place only after the tool succeeded and every temp is non-empty, so a
    /// final path is either absent or complete.
    pub fn run(task: &UnitTask, tool: &dyn UnitTool) -> Result<UnitOutcome, PipelineError> {
        let unit = task.label.as_str();
        if task.is_complete() {
            info!(unit, status = "already-complete", "unit skipped");
            return Ok(UnitOutcome::AlreadyComplete);
        }
        let Some(target) = task.lock_target() else {
            return Err(PipelineError::Filesystem(format!("{unit} declares no outputs")));
        };

        let Some(_lock) = UnitLock::try_acquire(&lock_path(target))? else {
            info!(unit, status = "locked-elsewhere", "unit skipped");
            return Ok(UnitOutcome::LockedElsewhere);
        };
        if task.is_complete() {
            info!(unit, status = "already-complete", "unit skipped");
            return Ok(UnitOutcome::AlreadyComplete);
        }

        if let Some(missing) = task.inputs.iter().find(|path| !is_complete(path)) {
            error!(unit, status = "failed", input = %missing, "input missing");
            return Err(PipelineError::InputMissing {
                unit: unit.to_string(),
                path: missing.clone(),
            });
        }

        let temps = task
            .outputs
            .iter()
            .map(|path| temp_path(path))
            .collect::<Vec<_>>();
        for (output, temp) in task.outputs.iter().zip(&temps) {
            ensure_parent(output)?;
            remove_if_exists(temp)?;
        }

        let started = Instant::now();
        if let Err(err) = tool.run(&temps) {
            discard(&temps);
            error!(unit, status = "failed", error = %err, "tool failed");
            return Err(err);
        }

        for (output, temp) in task.outputs.iter().zip(&temps) {
            if !is_complete(temp) {
                discard(&temps);
                error!(unit, status = "failed", output = %output, "empty output after success");
                return Err(PipelineError::EmptyArtifact {
                    unit: unit.to_string(),
                    path: output.clone(),
                });
            }
        }
        for (output, temp) in task.outputs.iter().zip(&temps) {
            if let Err(err) = fs::rename(temp.as_std_path(), output.as_std_path()) {
                discard(&temps);
                error!(unit, status = "failed", output = %output, error = %err, "rename failed");
                return Err(PipelineError::Filesystem(format!("rename {temp}: {err}")));
            }
        }

        info!(
            unit,
            status = "complete",
            elapsed_ms = started.elapsed().as_millis() as u64,
            "unit finished"
        );
        Ok(UnitOutcome::Completed)
    }
}

fn discard(temps: &[Utf8PathBuf]) {
    for temp in temps {
        let _ = remove_if_exists(temp);
    }
}

/// Advisory, non-blocking lock on a token file. Dropping it removes the token
/// and releases the lock.
#[derive(Debug)]
pub struct UnitLock {
    file: File,
    path: Utf8PathBuf,
}

impl UnitLock {
    pub fn try_acquire(path: &Utf8Path) -> Result<Option<Self>, PipelineError> {
        ensure_parent(path)?;
        // A releasing holder unlinks the token; retry if we locked a stale inode.
        for _ in 0..3 {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(path.as_std_path())
                .map_err(|err| PipelineError::Filesystem(format!("open {path}: {err}")))?;
            match file.try_lock() {
                Ok(()) => {}
                Err(TryLockError::WouldBlock) => return Ok(None),
                Err(TryLockError::Error(err)) => {
                    return Err(PipelineError::Filesystem(format!("lock {path}: {err}")));
                }
            }
            match fs::metadata(path.as_std_path()) {
                Ok(meta) if same_inode(&file, &meta) => {
                    return Ok(Some(Self {
                        file,
                        path: path.to_path_buf(),
                    }));
                }
                Ok(_) => return Ok(None),
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(PipelineError::Filesystem(format!("stat {path}: {err}")));
                }
            }
        }
        Ok(None)
    }
}

impl Drop for UnitLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path.as_std_path());
        let _ = self.file.unlock();
    }
}

#[cfg(unix)]
fn same_inode(file: &File, meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    file.metadata()
        .map(|own| own.dev() == meta.dev() && own.ino() == meta.ino())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn same_inode(_file: &File, _meta: &fs::Metadata) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_token_is_refused() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let token = root.join(".lock.a.tsv");

        let first = UnitLock::try_acquire(&token).unwrap().unwrap();
        assert!(UnitLock::try_acquire(&token).unwrap().is_none());
        drop(first);

        assert!(!token.as_std_path().exists());
        assert!(UnitLock::try_acquire(&token).unwrap().is_some());
    }
}
