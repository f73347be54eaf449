use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::domain::{SampleId, TaxonLevel};
use crate::stage::StageId;

/// Observable state of one output path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactState {
    Absent,
    InProgress,
    Complete,
}

/// Output namespace keyed by (stage, sample) or (stage, singleton).
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: Utf8PathBuf,
    levels: Vec<TaxonLevel>,
}

impl ArtifactStore {
    pub fn new(root: Utf8PathBuf, levels: Vec<TaxonLevel>) -> Self {
        Self { root, levels }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn levels(&self) -> &[TaxonLevel] {
        &self.levels
    }

    pub fn trimmed_reads(&self, sample: &SampleId) -> (Utf8PathBuf, Utf8PathBuf) {
        let dir = self.root.join("trimmed");
        (
            dir.join(format!("{sample}_R1.trimmed.fastq.gz")),
            dir.join(format!("{sample}_R2.trimmed.fastq.gz")),
        )
    }

    pub fn profile_report(&self, sample: &SampleId) -> Utf8PathBuf {
        self.root.join("profile").join(format!("{sample}.kreport"))
    }

    pub fn level_summary(&self, sample: &SampleId, level: TaxonLevel) -> Utf8PathBuf {
        self.root
            .join("levels")
            .join(level.code())
            .join(format!("{sample}.{level}.bracken"))
    }

    pub fn group_output(&self, group: &str, level: TaxonLevel) -> Utf8PathBuf {
        self.root
            .join("groups")
            .join(group)
            .join(format!("{group}.{level}.tsv"))
    }

    pub fn alignment(&self, sample: &SampleId) -> Utf8PathBuf {
        self.root
            .join("diamond")
            .join(format!("{sample}.diamond.tsv"))
    }

    pub fn extracted_hits(&self, sample: &SampleId) -> Utf8PathBuf {
        self.root
            .join("kegg_hits")
            .join(format!("{sample}_kegg_hits.tsv"))
    }

    pub fn summed_hits(&self, sample: &SampleId) -> Utf8PathBuf {
        self.root
            .join("kegg_summed")
            .join(format!("{sample}_kegg_hits_summed.tsv"))
    }

    pub fn group_manifest(&self) -> Utf8PathBuf {
        self.root.join("groups").join("manifest.json")
    }

    pub fn genome_equivalents(&self) -> Utf8PathBuf {
        self.root.join("stats").join("kegg_stats.tsv")
    }

    pub fn feature_table(&self) -> Utf8PathBuf {
        self.root.join("normalized_kegg_results.tsv")
    }

    /// Every output one per-sample unit of `stage` must leave behind.
    pub fn unit_outputs(&self, stage: StageId, sample: &SampleId) -> Vec<Utf8PathBuf> {
        match stage {
            StageId::Profile => {
                let (r1, r2) = self.trimmed_reads(sample);
                let mut outputs = vec![r1, r2];
                outputs.extend(
                    self.levels
                        .iter()
                        .map(|level| self.level_summary(sample, *level)),
                );
                outputs.push(self.profile_report(sample));
                outputs
            }
            StageId::Align => vec![self.alignment(sample)],
            StageId::ExtractHits => vec![self.extracted_hits(sample)],
            StageId::SumHits => vec![self.summed_hits(sample)],
            StageId::GroupSummary | StageId::GenomeEquivalents | StageId::Normalize => {
                self.singleton_output(stage).into_iter().collect()
            }
        }
    }

    pub fn singleton_output(&self, stage: StageId) -> Option<Utf8PathBuf> {
        match stage {
            StageId::GroupSummary => Some(self.group_manifest()),
            StageId::GenomeEquivalents => Some(self.genome_equivalents()),
            StageId::Normalize => Some(self.feature_table()),
            _ => None,
        }
    }

    pub fn state(path: &Utf8Path) -> ArtifactState {
        if is_complete(path) {
            ArtifactState::Complete
        } else if temp_path(path).as_std_path().exists() {
            ArtifactState::InProgress
        } else {
            ArtifactState::Absent
        }
    }

    pub fn unit_complete(&self, stage: StageId, sample: &SampleId) -> bool {
        self.unit_outputs(stage, sample)
            .iter()
            .all(|path| is_complete(path))
    }
}

/// Final file present and non-empty.
pub fn is_complete(path: &Utf8Path) -> bool {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Hidden sibling that keeps the final name's extension, so tools that infer
/// compression from it still behave.
pub fn temp_path(path: &Utf8Path) -> Utf8PathBuf {
    sibling(path, "tmp")
}

pub fn lock_path(path: &Utf8Path) -> Utf8PathBuf {
    sibling(path, "lock")
}

fn sibling(path: &Utf8Path, tag: &str) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or("artifact");
    path.with_file_name(format!(".{tag}.{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = ArtifactStore::new(Utf8PathBuf::from("/out"), vec![TaxonLevel::Genus]);
        let sample: SampleId = "S1".parse().unwrap();

        assert!(
            store
                .summed_hits(&sample)
                .ends_with("kegg_summed/S1_kegg_hits_summed.tsv")
        );
        assert!(store.level_summary(&sample, TaxonLevel::Genus).ends_with("levels/G/S1.G.bracken"));
        assert_eq!(
            temp_path(&store.alignment(&sample)),
            Utf8PathBuf::from("/out/diamond/.tmp.S1.diamond.tsv")
        );
        let outputs = store.unit_outputs(StageId::Profile, &sample);
        assert_eq!(outputs.len(), 4);
        assert!(outputs.contains(&store.profile_report(&sample)));
    }

    #[test]
    fn state_tracks_temp_and_final() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let path = root.join("a.tsv");

        assert_eq!(ArtifactStore::state(&path), ArtifactState::Absent);
        fs::write(temp_path(&path).as_std_path(), b"partial").unwrap();
        assert_eq!(ArtifactStore::state(&path), ArtifactState::InProgress);
        fs::write(path.as_std_path(), b"").unwrap();
        assert_eq!(ArtifactStore::state(&path), ArtifactState::InProgress);
        fs::write(path.as_std_path(), b"done").unwrap();
        assert_eq!(ArtifactStore::state(&path), ArtifactState::Complete);
    }
}
