use std::collections::BTreeMap;
use std::fmt::Write as _;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{KoId, SampleId};
use crate::error::PipelineError;
use crate::fs_util;
use crate::hits::SUMMED_HEADER;

pub type KoCounts = BTreeMap<KoId, u64>;

pub const STATS_HEADER: &str = "run_accession\tnum_genomes\tsingle_copy_kos\tsingle_copy_hits";

/// Universal single-copy marker genes used to estimate genome copies.
pub const SINGLE_COPY_KOS: [&str; 108] = [
    "K09748", "K03687", "K00962", "K02864", "K02994", "K02996", "K03438", "K02835", "K02836",
    "K02968", "K07042", "K11749", "K02879", "K02888", "K03110", "K03531", "K02834", "K11753",
    "K03550", "K03664", "K15429", "K09710", "K08316", "K03545", "K02357", "K03501", "K02939",
    "K02990", "K02520", "K03218", "K03703", "K07447", "K01937", "K01872", "K02313", "K03544",
    "K01870", "K01869", "K01874", "K01875", "K04485", "K03177", "K01883", "K03595", "K01892",
    "K01000", "K01887", "K01876", "K00604", "K01889", "K01890", "K02519", "K02838", "K02495",
    "K03723", "K06187", "K03702", "K03631", "K03551", "K03655", "K02338", "K02945", "K02528",
    "K03075", "K02601", "K01756", "K03106", "K03070", "K03073", "K03076", "K02988", "K02992",
    "K02887", "K02112", "K02890", "K02470", "K02469", "K02871", "K02876", "K02895", "K01924",
    "K01925", "K02340", "K02878", "K02863", "K02886", "K00088", "K02316", "K03596", "K06207",
    "K03625", "K02600", "K03553", "K03043", "K03040", "K03685", "K02860", "K03046", "K02343",
    "K04075", "K03979", "K00942", "K03977", "K02906", "K02948", "K25706", "K14742", "K02926",
];

/// Reads a summed-hits table. The header row and rows with unparseable ids or
/// counts are ignored; repeated KO rows add up.
pub fn read_summed(path: &Utf8Path) -> Result<KoCounts, PipelineError> {
    let mut counts = KoCounts::new();
    let mut ignored = 0usize;
    for line in fs_util::read_lines(path)? {
        if line.is_empty() || line == SUMMED_HEADER {
            continue;
        }
        let mut parts = line.split('\t');
        let (Some(ko), Some(count)) = (parts.next(), parts.next()) else {
            continue;
        };
        match (ko.parse::<KoId>(), count.trim().parse::<u64>()) {
            (Ok(ko), Ok(count)) => *counts.entry(ko).or_default() += count,
            _ => ignored += 1,
        }
    }
    if ignored > 0 {
        warn!(path = %path, ignored, "non-numeric rows ignored");
    }
    Ok(counts)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenomeEquivalent {
    pub sample: SampleId,
    pub num_genomes: Option<f64>,
    pub single_copy_kos: usize,
    pub single_copy_hits: u64,
}

/// Mean count over the reference KOs the sample actually has. Reference KOs
/// absent from the table are left out of the denominator; with none present
/// the estimate is undefined.
pub fn estimate_genome_equivalent(sample: &SampleId, counts: &KoCounts) -> GenomeEquivalent {
    let present = SINGLE_COPY_KOS
        .iter()
        .filter_map(|ko| ko.parse::<KoId>().ok())
        .filter_map(|ko| counts.get(&ko).copied())
        .collect::<Vec<_>>();
    let total: u64 = present.iter().sum();
    let num_genomes = (!present.is_empty()).then(|| total as f64 / present.len() as f64);
    GenomeEquivalent {
        sample: sample.clone(),
        num_genomes,
        single_copy_kos: present.len(),
        single_copy_hits: total,
    }
}

pub fn render_genome_equivalents(rows: &[GenomeEquivalent]) -> String {
    let mut out = String::from(STATS_HEADER);
    out.push('\n');
    for row in rows {
        let value = row
            .num_genomes
            .map(|value| value.to_string())
            .unwrap_or_else(|| "NA".to_string());
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}",
            row.sample, value, row.single_copy_kos, row.single_copy_hits
        );
    }
    out
}

pub fn read_genome_equivalents(
    path: &Utf8Path,
) -> Result<BTreeMap<SampleId, Option<f64>>, PipelineError> {
    let mut values = BTreeMap::new();
    for (index, line) in fs_util::read_lines(path)?.into_iter().enumerate() {
        if index == 0 || line.is_empty() {
            continue;
        }
        let mut parts = line.split('\t');
        let (Some(sample), Some(value)) = (parts.next(), parts.next()) else {
            return Err(PipelineError::MalformedTable {
                path: path.to_path_buf(),
                message: format!("line {} has fewer than two columns", index + 1),
            });
        };
        let value = match value.trim() {
            "" | "NA" => None,
            raw => Some(raw.parse::<f64>().map_err(|_| PipelineError::MalformedTable {
                path: path.to_path_buf(),
                message: format!("line {}: `{raw}` is not a number", index + 1),
            })?),
        };
        values.insert(sample.parse()?, value);
    }
    Ok(values)
}

/// KO-by-sample matrix; rows are KO-sorted, columns keep the caller's order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub samples: Vec<SampleId>,
    pub rows: BTreeMap<KoId, Vec<f64>>,
}

impl FeatureTable {
    pub fn value(&self, ko: &str, sample: &str) -> Option<f64> {
        let column = self.samples.iter().position(|id| id.as_str() == sample)?;
        self.rows
            .iter()
            .find(|(id, _)| id.as_str() == ko)
            .and_then(|(_, values)| values.get(column).copied())
    }

    pub fn to_tsv(&self) -> String {
        let mut out = String::from("kegg_number");
        for sample in &self.samples {
            out.push('\t');
            out.push_str(sample.as_str());
        }
        out.push('\n');
        for (ko, values) in &self.rows {
            out.push_str(ko.as_str());
            for value in values {
                let _ = write!(out, "\t{value:.6}");
            }
            out.push('\n');
        }
        out
    }
}

/// Outer join of per-sample counts (missing = 0), each column divided by its
/// sample's genome equivalent.
pub fn normalize(
    tables: &[(SampleId, KoCounts)],
    genome_equivalents: &BTreeMap<SampleId, Option<f64>>,
) -> Result<FeatureTable, PipelineError> {
    let mut divisors = Vec::with_capacity(tables.len());
    for (sample, _) in tables {
        let value = genome_equivalents
            .get(sample)
            .copied()
            .flatten()
            .ok_or_else(|| PipelineError::MissingGenomeEquivalent(sample.to_string()))?;
        if !value.is_finite() || value <= 0.0 {
            return Err(PipelineError::NonPositiveGenomeEquivalent {
                sample: sample.to_string(),
                value,
            });
        }
        divisors.push(value);
    }

    let mut rows: BTreeMap<KoId, Vec<f64>> = BTreeMap::new();
    for (column, (_, counts)) in tables.iter().enumerate() {
        for (ko, count) in counts {
            let row = rows
                .entry(ko.clone())
                .or_insert_with(|| vec![0.0; tables.len()]);
            row[column] = *count as f64 / divisors[column];
        }
    }
    if rows.is_empty() {
        return Err(PipelineError::EmptyKoTable(
            "no KO rows across all samples".to_string(),
        ));
    }

    info!(
        kos = rows.len(),
        samples = tables.len(),
        "feature table normalized"
    );
    Ok(FeatureTable {
        samples: tables.iter().map(|(sample, _)| sample.clone()).collect(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_set_has_no_duplicates() {
        let mut ids = SINGLE_COPY_KOS.to_vec();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), SINGLE_COPY_KOS.len());
        assert!(SINGLE_COPY_KOS.iter().all(|ko| ko.parse::<KoId>().is_ok()));
    }
}
