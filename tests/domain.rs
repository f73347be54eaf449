use assert_matches::assert_matches;

use kira_ko_pipeline::domain::{KoId, SampleId, TaxonLevel, default_levels};
use kira_ko_pipeline::error::PipelineError;
use kira_ko_pipeline::stage::{StageId, StageMode};

#[test]
fn parse_sample_id_valid() {
    let id: SampleId = " SRR1234_a.1 ".parse().unwrap();
    assert_eq!(id.as_str(), "SRR1234_a.1");
}

#[test]
fn parse_sample_id_invalid() {
    assert_matches!(
        "bad/id".parse::<SampleId>(),
        Err(PipelineError::InvalidSampleId(_))
    );
    assert_matches!("".parse::<SampleId>(), Err(PipelineError::InvalidSampleId(_)));
}

#[test]
fn parse_ko_id() {
    assert_eq!("k02992".parse::<KoId>().unwrap().as_str(), "K02992");
    assert_matches!("K2992X".parse::<KoId>(), Err(PipelineError::InvalidKoId(_)));
}

#[test]
fn parse_taxon_level_codes_and_names() {
    assert_eq!("S".parse::<TaxonLevel>().unwrap(), TaxonLevel::Species);
    assert_eq!("genus".parse::<TaxonLevel>().unwrap(), TaxonLevel::Genus);
    assert_matches!(
        "strain".parse::<TaxonLevel>(),
        Err(PipelineError::InvalidLevel(_))
    );
    assert_eq!(TaxonLevel::Phylum.to_string(), "P");
    assert_eq!(default_levels().len(), 6);
}

#[test]
fn stage_modes_deserialize_lowercase() {
    let modes: Vec<StageMode> = serde_json::from_str(r#"["auto", "run", "skip"]"#).unwrap();
    assert_eq!(modes, vec![StageMode::Auto, StageMode::Run, StageMode::Skip]);
    let stage: StageId = serde_json::from_str(r#""genome-equivalents""#).unwrap();
    assert_eq!(stage, StageId::GenomeEquivalents);
}
