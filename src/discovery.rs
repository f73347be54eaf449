use std::collections::BTreeMap;
use std::fs;
use std::sync::OnceLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::{info, warn};

use crate::domain::{Sample, SampleId};
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mate {
    First,
    Second,
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<id>.+?)_(?P<mate>R?[12])(?P<lane>_001)?\.(?:fastq|fq)\.gz$")
            .expect("static sample pattern")
    })
}

fn classify(file_name: &str) -> Option<(String, Mate, String)> {
    let caps = pattern().captures(file_name)?;
    let mate = match caps.name("mate")?.as_str() {
        "1" | "R1" => Mate::First,
        "2" | "R2" => Mate::Second,
        _ => return None,
    };
    let convention = format!(
        "{}{}",
        caps.name("mate")?.as_str().trim_end_matches(['1', '2']),
        caps.name("lane").map(|m| m.as_str()).unwrap_or("")
    );
    Some((caps.name("id")?.as_str().to_string(), mate, convention))
}

/// Pairs gzip FASTQ files in `input_dir` by shared prefix. Samples come back
/// sorted by id; that order defines array indices and table columns.
pub fn discover_samples(input_dir: &Utf8Path) -> Result<Vec<Sample>, PipelineError> {
    let entries = fs::read_dir(input_dir.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("read {input_dir}: {err}")))?;

    let mut pairs: BTreeMap<(String, String), (Option<Utf8PathBuf>, Option<Utf8PathBuf>)> =
        BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            warn!(path = %entry.path().display(), "skipping non-utf8 file name");
            continue;
        };
        if !path.is_file() {
            continue;
        }
        let Some((id, mate, convention)) = path.file_name().and_then(classify) else {
            continue;
        };
        let slot = pairs.entry((id, convention)).or_default();
        match mate {
            Mate::First => slot.0 = Some(path),
            Mate::Second => slot.1 = Some(path),
        }
    }

    let mut samples: Vec<Sample> = Vec::new();
    for ((id, _), pair) in pairs {
        match pair {
            (Some(read1), Some(read2)) => {
                let Ok(id) = id.parse::<SampleId>() else {
                    warn!(sample = %id, file = %read1, "invalid sample id; sample excluded");
                    continue;
                };
                if samples.iter().any(|sample| sample.id == id) {
                    warn!(sample = %id, "sample matches more than one naming convention; keeping the first");
                    continue;
                }
                samples.push(Sample { id, read1, read2 });
            }
            (Some(read), None) | (None, Some(read)) => {
                warn!(sample = %id, file = %read, "mate file missing; sample excluded");
            }
            (None, None) => {}
        }
    }

    if samples.is_empty() {
        return Err(PipelineError::NoSamples(input_dir.to_path_buf()));
    }
    samples.sort_by(|a, b| a.id.cmp(&b.id));
    info!(count = samples.len(), dir = %input_dir, "samples discovered");
    Ok(samples)
}
