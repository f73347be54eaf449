use std::collections::BTreeMap;
use std::fs;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{TaxonLevel, default_levels};
use crate::error::PipelineError;
use crate::groups::GroupSpec;
use crate::stage::{StageId, StageMode};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub input_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub output_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub log_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub auto_resume: Option<bool>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub groups: Option<String>,
    #[serde(default)]
    pub levels: Option<Vec<TaxonLevel>>,
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub stages: BTreeMap<StageId, StageMode>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub databases: DatabaseConfig,
    #[serde(default)]
    pub bracken: BrackenConfig,
    #[serde(default)]
    pub diamond: DiamondConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// How one external program is launched. `env` names a conda environment the
/// call is wrapped in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToolEntry {
    pub program: String,
    #[serde(default)]
    pub env: Option<String>,
}

impl ToolEntry {
    fn named(program: &str) -> Self {
        Self {
            program: program.to_string(),
            env: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default = "default_trimmer")]
    pub trimmer: ToolEntry,
    #[serde(default = "default_classifier")]
    pub classifier: ToolEntry,
    #[serde(default = "default_level_summarizer")]
    pub level_summarizer: ToolEntry,
    #[serde(default = "default_combiner")]
    pub combiner: ToolEntry,
    #[serde(default = "default_aligner")]
    pub aligner: ToolEntry,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            trimmer: default_trimmer(),
            classifier: default_classifier(),
            level_summarizer: default_level_summarizer(),
            combiner: default_combiner(),
            aligner: default_aligner(),
        }
    }
}

fn default_trimmer() -> ToolEntry {
    ToolEntry::named("fastp")
}

fn default_classifier() -> ToolEntry {
    ToolEntry::named("kraken2")
}

fn default_level_summarizer() -> ToolEntry {
    ToolEntry::named("bracken")
}

fn default_combiner() -> ToolEntry {
    ToolEntry::named("combine_bracken_outputs.py")
}

fn default_aligner() -> ToolEntry {
    ToolEntry::named("diamond")
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub kraken: Option<Utf8PathBuf>,
    #[serde(default)]
    pub diamond: Option<Utf8PathBuf>,
    #[serde(default)]
    pub kegg_annotations: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrackenConfig {
    #[serde(default = "default_read_length")]
    pub read_length: u32,
    #[serde(default = "default_threshold")]
    pub threshold: u32,
}

impl Default for BrackenConfig {
    fn default() -> Self {
        Self {
            read_length: default_read_length(),
            threshold: default_threshold(),
        }
    }
}

fn default_read_length() -> u32 {
    150
}

fn default_threshold() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiamondConfig {
    #[serde(default = "default_max_target_seqs")]
    pub max_target_seqs: u32,
}

impl Default for DiamondConfig {
    fn default() -> Self {
        Self {
            max_target_seqs: default_max_target_seqs(),
        }
    }
}

fn default_max_target_seqs() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub input_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    pub log_dir: Utf8PathBuf,
    pub auto_resume: bool,
    pub max_concurrent: Option<usize>,
    pub groups: GroupSpec,
    pub levels: Vec<TaxonLevel>,
    pub threads: u32,
    pub stage_modes: BTreeMap<StageId, StageMode>,
    pub tools: ToolsConfig,
    pub databases: DatabaseConfig,
    pub bracken: BrackenConfig,
    pub diamond: DiamondConfig,
    pub scheduler: SchedulerConfig,
}

impl ResolvedConfig {
    pub fn stage_mode(&self, stage: StageId) -> StageMode {
        self.stage_modes.get(&stage).copied().unwrap_or_default()
    }

    /// Database a stage cannot run without, if any.
    pub fn require_database(&self, stage: StageId) -> Result<(), PipelineError> {
        let (key, value) = match stage {
            StageId::Profile => ("databases.kraken", &self.databases.kraken),
            StageId::Align => ("databases.diamond", &self.databases.diamond),
            StageId::ExtractHits => (
                "databases.kegg_annotations",
                &self.databases.kegg_annotations,
            ),
            _ => return Ok(()),
        };
        if value.is_none() {
            return Err(PipelineError::MissingConfigValue(key.to_string()));
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PipelineError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from("kira-kp.json"),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Err(PipelineError::MissingConfig);
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| PipelineError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| PipelineError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PipelineError> {
        let input_dir = config
            .input_dir
            .ok_or_else(|| PipelineError::MissingConfigValue("input_dir".to_string()))?;
        let output_dir = config
            .output_dir
            .ok_or_else(|| PipelineError::MissingConfigValue("output_dir".to_string()))?;
        let log_dir = config
            .log_dir
            .unwrap_or_else(|| output_dir.join("logs"));

        if config.max_concurrent == Some(0) {
            return Err(PipelineError::ConfigParse(
                "max_concurrent must be at least 1".to_string(),
            ));
        }

        let levels = match config.levels {
            Some(levels) if levels.is_empty() => {
                return Err(PipelineError::MissingConfigValue("levels".to_string()));
            }
            Some(mut levels) => {
                levels.sort();
                levels.dedup();
                levels
            }
            None => default_levels(),
        };

        let groups = config
            .groups
            .as_deref()
            .map(str::parse::<GroupSpec>)
            .transpose()?
            .unwrap_or_default();

        Ok(ResolvedConfig {
            input_dir,
            output_dir,
            log_dir,
            auto_resume: config.auto_resume.unwrap_or(true),
            max_concurrent: config.max_concurrent,
            groups,
            levels,
            threads: config.threads.unwrap_or(8).max(1),
            stage_modes: config.stages,
            tools: config.tools,
            databases: config.databases,
            bracken: config.bracken,
            diamond: config.diamond,
            scheduler: config.scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_config_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"input_dir": "reads", "output_dir": "out"}"#).unwrap();

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert!(resolved.auto_resume);
        assert_eq!(resolved.log_dir, Utf8PathBuf::from("out/logs"));
        assert_eq!(resolved.levels, default_levels());
        assert_eq!(resolved.stage_mode(StageId::Align), StageMode::Auto);
        assert_eq!(resolved.tools.aligner.program, "diamond");
        assert!(resolved.groups.is_implicit());
    }

    #[test]
    fn missing_output_dir_is_reported() {
        let config = Config {
            input_dir: Some(Utf8PathBuf::from("reads")),
            ..Config::default()
        };
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, PipelineError::MissingConfigValue(key) if key == "output_dir");
    }
}
