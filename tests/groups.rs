use std::fs;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use kira_ko_pipeline::domain::{Sample, SampleId, TaxonLevel};
use kira_ko_pipeline::error::PipelineError;
use kira_ko_pipeline::executor::UnitOutcome;
use kira_ko_pipeline::groups::{GroupSpec, IMPLICIT_GROUP, summarize_groups};
use kira_ko_pipeline::store::ArtifactStore;
use kira_ko_pipeline::tools::ExternalTools;

/// Only `combine` is exercised here; it writes the member names it was given.
#[derive(Default)]
struct CombineOnly {
    failing_group: Option<String>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ExternalTools for CombineOnly {
    fn trim(
        &self,
        _reads: (&Utf8Path, &Utf8Path),
        _trimmed: (&Utf8Path, &Utf8Path),
    ) -> Result<(), PipelineError> {
        Err(PipelineError::MissingTool("fastp".to_string()))
    }

    fn classify(
        &self,
        _reads: (&Utf8Path, &Utf8Path),
        _report: &Utf8Path,
    ) -> Result<(), PipelineError> {
        Err(PipelineError::MissingTool("kraken2".to_string()))
    }

    fn summarize_level(
        &self,
        _report: &Utf8Path,
        _level: TaxonLevel,
        _output: &Utf8Path,
    ) -> Result<(), PipelineError> {
        Err(PipelineError::MissingTool("bracken".to_string()))
    }

    fn combine(
        &self,
        summaries: &[(SampleId, Utf8PathBuf)],
        output: &Utf8Path,
    ) -> Result<(), PipelineError> {
        let names = summaries
            .iter()
            .map(|(id, _)| id.to_string())
            .collect::<Vec<_>>();
        self.calls.lock().unwrap().push(names.clone());
        if let Some(group) = &self.failing_group
            && output.as_str().contains(&format!("/{group}/"))
        {
            return Err(PipelineError::ToolFailed {
                tool: "combine_bracken_outputs.py".to_string(),
                message: "bad input".to_string(),
            });
        }
        fs::write(output, format!("name\t{}\n", names.join("\t"))).unwrap();
        Ok(())
    }

    fn align(
        &self,
        _reads: (&Utf8Path, &Utf8Path),
        _output: &Utf8Path,
    ) -> Result<(), PipelineError> {
        Err(PipelineError::MissingTool("diamond".to_string()))
    }
}

fn setup(ids: &[&str], levels: Vec<TaxonLevel>) -> (tempfile::TempDir, ArtifactStore, Vec<Sample>) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = ArtifactStore::new(root, levels);
    let samples = ids
        .iter()
        .map(|id| Sample {
            id: id.parse().unwrap(),
            read1: Utf8PathBuf::from(format!("{id}_R1.fastq.gz")),
            read2: Utf8PathBuf::from(format!("{id}_R2.fastq.gz")),
        })
        .collect();
    (temp, store, samples)
}

fn write_summary(store: &ArtifactStore, id: &str, level: TaxonLevel) {
    let path = store.level_summary(&id.parse().unwrap(), level);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, "name\ttaxonomy_id\tnew_est_reads\n").unwrap();
}

#[test]
fn unresolved_members_warn_but_do_not_fail() {
    let (_temp, store, samples) = setup(&["S1", "S2"], vec![TaxonLevel::Genus]);
    write_summary(&store, "S1", TaxonLevel::Genus);
    let spec: GroupSpec = "ctrl:S1,S2,S9".parse().unwrap();
    let tools = CombineOnly::default();

    let outcome = summarize_groups(&store, &samples, &spec, &tools).unwrap();
    assert_eq!(outcome, UnitOutcome::Completed);
    assert_eq!(*tools.calls.lock().unwrap(), vec![vec!["S1".to_string()]]);

    let output = store.group_output("ctrl", TaxonLevel::Genus);
    assert_eq!(fs::read_to_string(output).unwrap(), "name\tS1\n");

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(store.group_manifest()).unwrap()).unwrap();
    let level = &manifest["groups"][0]["levels"][0];
    assert_eq!(level["included"], serde_json::json!(["S1"]));
    assert_eq!(level["excluded"], serde_json::json!(["S2", "S9"]));
}

#[test]
fn empty_combination_is_skipped() {
    let (_temp, store, samples) =
        setup(&["S1"], vec![TaxonLevel::Genus, TaxonLevel::Species]);
    write_summary(&store, "S1", TaxonLevel::Genus);
    let tools = CombineOnly::default();

    let outcome = summarize_groups(&store, &samples, &GroupSpec::default(), &tools).unwrap();
    assert_eq!(outcome, UnitOutcome::Completed);
    assert!(store.group_output(IMPLICIT_GROUP, TaxonLevel::Genus).exists());
    assert!(!store.group_output(IMPLICIT_GROUP, TaxonLevel::Species).exists());

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(store.group_manifest()).unwrap()).unwrap();
    assert_eq!(
        manifest["skipped"],
        serde_json::json!([format!("{IMPLICIT_GROUP}/S")])
    );
}

#[test]
fn failed_combination_fails_stage() {
    let (_temp, store, samples) = setup(&["S1", "S2"], vec![TaxonLevel::Genus]);
    write_summary(&store, "S1", TaxonLevel::Genus);
    write_summary(&store, "S2", TaxonLevel::Genus);
    let spec: GroupSpec = "good:S1;bad:S2".parse().unwrap();
    let tools = CombineOnly {
        failing_group: Some("bad".to_string()),
        ..CombineOnly::default()
    };

    let err = summarize_groups(&store, &samples, &spec, &tools).unwrap_err();
    assert_matches!(err, PipelineError::GroupCombination(1));
    assert!(store.group_output("good", TaxonLevel::Genus).exists());
    assert!(!store.group_output("bad", TaxonLevel::Genus).exists());
    assert!(!store.group_manifest().exists());
}

#[test]
fn completed_summary_is_not_redone() {
    let (_temp, store, samples) = setup(&["S1", "S2"], vec![TaxonLevel::Genus]);
    write_summary(&store, "S1", TaxonLevel::Genus);
    write_summary(&store, "S2", TaxonLevel::Genus);
    let spec: GroupSpec = "a:S1,S2;b:S2".parse().unwrap();
    let tools = CombineOnly::default();

    assert_eq!(
        summarize_groups(&store, &samples, &spec, &tools).unwrap(),
        UnitOutcome::Completed
    );
    assert_eq!(
        summarize_groups(&store, &samples, &spec, &tools).unwrap(),
        UnitOutcome::AlreadyComplete
    );
    assert_eq!(tools.calls.lock().unwrap().len(), 2);
}

#[test]
fn shared_member_is_allowed() {
    let spec: GroupSpec = "a:S1,S2;b:S2,S3".parse().unwrap();
    let GroupSpec::Explicit(groups) = spec else {
        panic!("expected explicit groups");
    };
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[1].members[0].as_str(), "S2");
}
