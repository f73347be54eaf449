use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use std::sync::OnceLock;

use camino::Utf8Path;
use regex::Regex;
use tracing::info;

use crate::domain::KoId;
use crate::error::PipelineError;
use crate::fs_util;

pub const EXTRACTED_HEADER: &str = "qseqid\tkegg_number\tnum_hits";
pub const SUMMED_HEADER: &str = "kegg_number\tsum_num_hits";

fn ko_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"K\d{5}").expect("static KO pattern"))
}

/// Gene id to KO assignments read from a KEGG annotation dump.
#[derive(Debug, Default)]
pub struct KoMapping {
    genes: HashMap<String, KoId>,
}

impl KoMapping {
    pub fn load(path: &Utf8Path) -> Result<Self, PipelineError> {
        let mapping = Self::parse(fs_util::open_text(path)?)?;
        if mapping.is_empty() {
            return Err(PipelineError::EmptyAnnotations(path.to_path_buf()));
        }
        info!(path = %path, genes = mapping.len(), "KEGG annotations loaded");
        Ok(mapping)
    }

    /// `gene_id<TAB>annotation`; the first `K#####` in the annotation wins.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self, PipelineError> {
        let mut genes = HashMap::new();
        for line in reader.lines() {
            let line = line.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            let mut parts = line.trim_end().split('\t');
            let (Some(gene), Some(annotation)) = (parts.next(), parts.next()) else {
                continue;
            };
            if let Some(found) = ko_pattern().find(annotation) {
                genes.insert(gene.to_string(), found.as_str().parse()?);
            }
        }
        Ok(Self { genes })
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    /// Resolves an alignment subject id such as `gnl|kegg|eco:b0001.1`.
    pub fn lookup(&self, subject: &str) -> Option<&KoId> {
        let gene = subject.rsplit('|').next().unwrap_or(subject);
        self.genes.get(gene).or_else(|| {
            let base = gene.split('.').next().unwrap_or(gene);
            self.genes.get(base)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub total_lines: usize,
    pub skipped_lines: usize,
    pub unmapped: usize,
    pub queries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitRow {
    pub query: String,
    pub ko: KoId,
    pub hits: u64,
}

/// Maps every alignment row to a KO and counts hits per (query, KO).
pub fn extract_hits<R: BufRead>(
    alignment: R,
    mapping: &KoMapping,
) -> Result<(Vec<HitRow>, ExtractionStats), PipelineError> {
    let mut counts: BTreeMap<String, BTreeMap<KoId, u64>> = BTreeMap::new();
    let mut stats = ExtractionStats::default();
    for line in alignment.lines() {
        let line = line.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        stats.total_lines += 1;
        if line.starts_with("qseqid") || line.starts_with('#') {
            stats.skipped_lines += 1;
            continue;
        }
        let mut parts = line.trim_end().split('\t');
        let (Some(query), Some(subject)) = (parts.next(), parts.next()) else {
            stats.skipped_lines += 1;
            continue;
        };
        match mapping.lookup(subject) {
            Some(ko) => {
                *counts
                    .entry(query.to_string())
                    .or_default()
                    .entry(ko.clone())
                    .or_default() += 1;
            }
            None => stats.unmapped += 1,
        }
    }
    stats.queries = counts.len();

    let rows = counts
        .into_iter()
        .flat_map(|(query, per_ko)| {
            per_ko.into_iter().map(move |(ko, hits)| HitRow {
                query: query.clone(),
                ko,
                hits,
            })
        })
        .collect();
    Ok((rows, stats))
}

pub fn render_hit_rows(rows: &[HitRow]) -> String {
    let mut out = String::from(EXTRACTED_HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&format!("{}\t{}\t{}\n", row.query, row.ko, row.hits));
    }
    out
}

/// Reads extracted hits. A missing count column means one hit; rows with a
/// non-numeric count are skipped and counted.
pub fn read_hit_rows(path: &Utf8Path) -> Result<(Vec<HitRow>, usize), PipelineError> {
    let mut rows = Vec::new();
    let mut skipped = 0;
    for line in fs_util::read_lines(path)? {
        if line.is_empty() || line == EXTRACTED_HEADER {
            continue;
        }
        let mut parts = line.split('\t');
        let (Some(query), Some(ko)) = (parts.next(), parts.next()) else {
            skipped += 1;
            continue;
        };
        let Ok(ko) = ko.parse::<KoId>() else {
            skipped += 1;
            continue;
        };
        let hits = match parts.next().map(str::trim) {
            None | Some("") => 1,
            Some(value) => match value.parse::<u64>() {
                Ok(hits) => hits,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            },
        };
        rows.push(HitRow {
            query: query.to_string(),
            ko,
            hits,
        });
    }
    Ok((rows, skipped))
}

/// Total hits per KO. Repeated rows add up.
pub fn sum_hits(rows: &[HitRow]) -> BTreeMap<KoId, u64> {
    let mut sums = BTreeMap::new();
    for row in rows {
        *sums.entry(row.ko.clone()).or_default() += row.hits;
    }
    sums
}

pub fn render_summed(sums: &BTreeMap<KoId, u64>) -> String {
    let mut out = String::from(SUMMED_HEADER);
    out.push('\n');
    for (ko, total) in sums {
        out.push_str(&format!("{ko}\t{total}\n"));
    }
    out
}

/// Hit extraction for one sample, writing into `output`.
pub fn extract_to(
    alignment: &Utf8Path,
    mapping: &KoMapping,
    output: &Utf8Path,
) -> Result<ExtractionStats, PipelineError> {
    let (rows, stats) = extract_hits(fs_util::open_text(alignment)?, mapping)?;
    std::fs::write(output.as_std_path(), render_hit_rows(&rows))
        .map_err(|err| PipelineError::Filesystem(format!("write {output}: {err}")))?;
    info!(
        input = %alignment,
        lines = stats.total_lines,
        skipped = stats.skipped_lines,
        unmapped = stats.unmapped,
        queries = stats.queries,
        "hits extracted"
    );
    Ok(stats)
}

/// Hit summation for one sample, writing into `output`.
pub fn sum_to(extracted: &Utf8Path, output: &Utf8Path) -> Result<usize, PipelineError> {
    let (rows, skipped) = read_hit_rows(extracted)?;
    let sums = sum_hits(&rows);
    std::fs::write(output.as_std_path(), render_summed(&sums))
        .map_err(|err| PipelineError::Filesystem(format!("write {output}: {err}")))?;
    info!(input = %extracted, kos = sums.len(), skipped, "hits summed");
    Ok(sums.len())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn subject_prefix_and_version_are_stripped() {
        let mapping =
            KoMapping::parse(Cursor::new("eco:b0001\tKO:K00001 thrL\nb2\tnone\n")).unwrap();
        assert_eq!(mapping.len(), 1);
        assert_eq!(
            mapping.lookup("gnl|kegg|eco:b0001.2").map(KoId::as_str),
            Some("K00001")
        );
        assert!(mapping.lookup("b2").is_none());
    }
}
