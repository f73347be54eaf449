use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SampleId(String);

impl SampleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SampleId {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
        if !is_valid {
            return Err(PipelineError::InvalidSampleId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// A paired-end sample discovered in the input directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub id: SampleId,
    pub read1: Utf8PathBuf,
    pub read2: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KoId(String);

impl KoId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for KoId {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let is_valid = normalized.len() == 6
            && normalized.starts_with('K')
            && normalized[1..].chars().all(|ch| ch.is_ascii_digit());
        if !is_valid {
            return Err(PipelineError::InvalidKoId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Rank at which per-sample abundance summaries are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaxonLevel {
    #[serde(rename = "D", alias = "domain")]
    Domain,
    #[serde(rename = "P", alias = "phylum")]
    Phylum,
    #[serde(rename = "C", alias = "class")]
    Class,
    #[serde(rename = "O", alias = "order")]
    Order,
    #[serde(rename = "F", alias = "family")]
    Family,
    #[serde(rename = "G", alias = "genus")]
    Genus,
    #[serde(rename = "S", alias = "species")]
    Species,
}

impl TaxonLevel {
    pub fn code(self) -> &'static str {
        match self {
            TaxonLevel::Domain => "D",
            TaxonLevel::Phylum => "P",
            TaxonLevel::Class => "C",
            TaxonLevel::Order => "O",
            TaxonLevel::Family => "F",
            TaxonLevel::Genus => "G",
            TaxonLevel::Species => "S",
        }
    }
}

impl fmt::Display for TaxonLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for TaxonLevel {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "d" | "domain" => Ok(TaxonLevel::Domain),
            "p" | "phylum" => Ok(TaxonLevel::Phylum),
            "c" | "class" => Ok(TaxonLevel::Class),
            "o" | "order" => Ok(TaxonLevel::Order),
            "f" | "family" => Ok(TaxonLevel::Family),
            "g" | "genus" => Ok(TaxonLevel::Genus),
            "s" | "species" => Ok(TaxonLevel::Species),
            _ => Err(PipelineError::InvalidLevel(value.to_string())),
        }
    }
}

pub fn default_levels() -> Vec<TaxonLevel> {
    vec![
        TaxonLevel::Phylum,
        TaxonLevel::Class,
        TaxonLevel::Order,
        TaxonLevel::Family,
        TaxonLevel::Genus,
        TaxonLevel::Species,
    ]
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_ko_id_normalizes_case() {
        let ko: KoId = " k00001".parse().unwrap();
        assert_eq!(ko.as_str(), "K00001");
    }

    #[test]
    fn parse_ko_id_invalid() {
        let err = "K0001".parse::<KoId>().unwrap_err();
        assert_matches!(err, PipelineError::InvalidKoId(_));
    }

    #[test]
    fn parse_sample_id_rejects_separators() {
        let err = "a,b".parse::<SampleId>().unwrap_err();
        assert_matches!(err, PipelineError::InvalidSampleId(_));
    }
}
