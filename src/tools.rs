use std::path::PathBuf;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::debug;

use crate::config::{ResolvedConfig, ToolEntry};
use crate::domain::{SampleId, TaxonLevel};
use crate::error::PipelineError;
use crate::fs_util;

/// The black-box programs the pipeline drives. Every method writes only to the
/// paths it is given.
pub trait ExternalTools: Send + Sync {
    fn trim(
        &self,
        reads: (&Utf8Path, &Utf8Path),
        trimmed: (&Utf8Path, &Utf8Path),
    ) -> Result<(), PipelineError>;

    fn classify(
        &self,
        reads: (&Utf8Path, &Utf8Path),
        report: &Utf8Path,
    ) -> Result<(), PipelineError>;

    fn summarize_level(
        &self,
        report: &Utf8Path,
        level: TaxonLevel,
        output: &Utf8Path,
    ) -> Result<(), PipelineError>;

    fn combine(
        &self,
        summaries: &[(SampleId, Utf8PathBuf)],
        output: &Utf8Path,
    ) -> Result<(), PipelineError>;

    fn align(
        &self,
        reads: (&Utf8Path, &Utf8Path),
        output: &Utf8Path,
    ) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub trimmer: Option<String>,
    pub classifier: Option<String>,
    pub aligner: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SystemTools {
    trimmer: ToolEntry,
    classifier: ToolEntry,
    level_summarizer: ToolEntry,
    combiner: ToolEntry,
    aligner: ToolEntry,
    kraken_db: Option<Utf8PathBuf>,
    diamond_db: Option<Utf8PathBuf>,
    threads: u32,
    read_length: u32,
    threshold: u32,
    max_target_seqs: u32,
}

impl SystemTools {
    pub fn new(config: &ResolvedConfig) -> Self {
        Self {
            trimmer: config.tools.trimmer.clone(),
            classifier: config.tools.classifier.clone(),
            level_summarizer: config.tools.level_summarizer.clone(),
            combiner: config.tools.combiner.clone(),
            aligner: config.tools.aligner.clone(),
            kraken_db: config.databases.kraken.clone(),
            diamond_db: config.databases.diamond.clone(),
            threads: config.threads,
            read_length: config.bracken.read_length,
            threshold: config.bracken.threshold,
            max_target_seqs: config.diamond.max_target_seqs,
        }
    }

    pub fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            trimmer: tool_version(&self.trimmer, &["--version"]),
            classifier: tool_version(&self.classifier, &["--version"]),
            aligner: tool_version(&self.aligner, &["version"]),
        }
    }

    fn database<'a>(
        value: &'a Option<Utf8PathBuf>,
        key: &str,
    ) -> Result<&'a Utf8PathBuf, PipelineError> {
        value
            .as_ref()
            .ok_or_else(|| PipelineError::MissingConfigValue(key.to_string()))
    }
}

impl ExternalTools for SystemTools {
    fn trim(
        &self,
        reads: (&Utf8Path, &Utf8Path),
        trimmed: (&Utf8Path, &Utf8Path),
    ) -> Result<(), PipelineError> {
        let scratch = scratch_dir("kira-kp-trim")?;
        let args = vec![
            "-i".to_string(),
            reads.0.to_string(),
            "-I".to_string(),
            reads.1.to_string(),
            "-o".to_string(),
            trimmed.0.to_string(),
            "-O".to_string(),
            trimmed.1.to_string(),
            "-w".to_string(),
            self.threads.to_string(),
            "-j".to_string(),
            scratch.path().join("fastp.json").to_string_lossy().to_string(),
            "-h".to_string(),
            scratch.path().join("fastp.html").to_string_lossy().to_string(),
        ];
        run_cmd(&self.trimmer, &args)
    }

    fn classify(
        &self,
        reads: (&Utf8Path, &Utf8Path),
        report: &Utf8Path,
    ) -> Result<(), PipelineError> {
        let db = Self::database(&self.kraken_db, "databases.kraken")?;
        let scratch = scratch_dir("kira-kp-classify")?;
        let assignments = scratch.path().join("assignments.kraken");
        let args = vec![
            "--db".to_string(),
            db.to_string(),
            "--threads".to_string(),
            self.threads.to_string(),
            "--paired".to_string(),
            "--gzip-compressed".to_string(),
            "--report".to_string(),
            report.to_string(),
            "--output".to_string(),
            assignments.to_string_lossy().to_string(),
            reads.0.to_string(),
            reads.1.to_string(),
        ];
        run_cmd(&self.classifier, &args)
    }

    fn summarize_level(
        &self,
        report: &Utf8Path,
        level: TaxonLevel,
        output: &Utf8Path,
    ) -> Result<(), PipelineError> {
        let db = Self::database(&self.kraken_db, "databases.kraken")?;
        let scratch = scratch_dir("kira-kp-level")?;
        let rewritten = scratch.path().join("level.kreport");
        let args = vec![
            "-d".to_string(),
            db.to_string(),
            "-i".to_string(),
            report.to_string(),
            "-o".to_string(),
            output.to_string(),
            "-w".to_string(),
            rewritten.to_string_lossy().to_string(),
            "-r".to_string(),
            self.read_length.to_string(),
            "-l".to_string(),
            level.code().to_string(),
            "-t".to_string(),
            self.threshold.to_string(),
        ];
        run_cmd(&self.level_summarizer, &args)
    }

    fn combine(
        &self,
        summaries: &[(SampleId, Utf8PathBuf)],
        output: &Utf8Path,
    ) -> Result<(), PipelineError> {
        let mut args = vec!["--files".to_string()];
        args.extend(summaries.iter().map(|(_, path)| path.to_string()));
        args.push("--names".to_string());
        args.push(
            summaries
                .iter()
                .map(|(id, _)| id.as_str())
                .collect::<Vec<_>>()
                .join(","),
        );
        args.push("-o".to_string());
        args.push(output.to_string());
        run_cmd(&self.combiner, &args)
    }

    fn align(
        &self,
        reads: (&Utf8Path, &Utf8Path),
        output: &Utf8Path,
    ) -> Result<(), PipelineError> {
        let db = Self::database(&self.diamond_db, "databases.diamond")?;
        let scratch = scratch_dir("kira-kp-align")?;
        let query = Utf8PathBuf::from_path_buf(scratch.path().join("query.fastq.gz"))
            .map_err(|_| PipelineError::Filesystem("non-utf8 scratch path".to_string()))?;
        fs_util::concat_files(&[reads.0, reads.1], &query)?;

        let mut args = vec![
            "blastx".to_string(),
            "--db".to_string(),
            db.to_string(),
            "--query".to_string(),
            query.to_string(),
            "--out".to_string(),
            output.to_string(),
            "--threads".to_string(),
            self.threads.to_string(),
            "--max-target-seqs".to_string(),
            self.max_target_seqs.to_string(),
            "--header".to_string(),
            "simple".to_string(),
            "--outfmt".to_string(),
            "6".to_string(),
        ];
        args.extend(ALIGNMENT_COLUMNS.iter().map(|column| column.to_string()));
        run_cmd(&self.aligner, &args)
    }
}

/// Fixed tabular schema of the alignment stage's output.
pub const ALIGNMENT_COLUMNS: [&str; 12] = [
    "qseqid", "sseqid", "pident", "length", "mismatch", "gapopen", "qstart", "qend", "sstart",
    "send", "evalue", "bitscore",
];

fn scratch_dir(prefix: &str) -> Result<tempfile::TempDir, PipelineError> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .map_err(|err| PipelineError::Filesystem(err.to_string()))
}

/// Direct invocation, or `conda run -n <env> <program>` when an environment
/// selector is configured.
fn build_command(tool: &ToolEntry) -> Result<Command, PipelineError> {
    match &tool.env {
        Some(env) => {
            let conda = find_in_path("conda")
                .ok_or_else(|| PipelineError::MissingTool("conda".to_string()))?;
            let mut cmd = Command::new(conda);
            cmd.args([
                "run",
                "--no-capture-output",
                "-n",
                env.as_str(),
                tool.program.as_str(),
            ]);
            Ok(cmd)
        }
        None => {
            let program = find_in_path(&tool.program)
                .ok_or_else(|| PipelineError::MissingTool(tool.program.clone()))?;
            Ok(Command::new(program))
        }
    }
}

fn run_cmd(tool: &ToolEntry, args: &[String]) -> Result<(), PipelineError> {
    let mut cmd = build_command(tool)?;
    cmd.args(args);
    debug!(program = %tool.program, ?args, "invoking tool");
    let output = cmd.output().map_err(|err| PipelineError::ToolFailed {
        tool: tool.program.clone(),
        message: err.to_string(),
    })?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    };
    Err(PipelineError::ToolFailed {
        tool: tool.program.clone(),
        message,
    })
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(name);
    if candidate.components().count() > 1 {
        return candidate.exists().then_some(candidate);
    }
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

fn tool_version(tool: &ToolEntry, args: &[&str]) -> Option<String> {
    let output = build_command(tool).ok()?.args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let text = if stdout.is_empty() { stderr } else { stdout };
    text.lines().next().map(str::to_string).filter(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn missing_program_is_reported() {
        let tool = ToolEntry {
            program: "kira-kp-definitely-not-installed".to_string(),
            env: None,
        };
        let err = run_cmd(&tool, &[]).unwrap_err();
        assert_matches!(err, PipelineError::MissingTool(name) if name == tool.program);
    }

    #[test]
    fn alignment_schema_has_twelve_columns() {
        assert_eq!(ALIGNMENT_COLUMNS.len(), 12);
        assert_eq!(ALIGNMENT_COLUMNS[0], "qseqid");
        assert_eq!(ALIGNMENT_COLUMNS[1], "sseqid");
    }
}
