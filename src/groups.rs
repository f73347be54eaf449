use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::{Sample, SampleId, TaxonLevel};
use crate::error::PipelineError;
use crate::executor::{UnitExecutor, UnitOutcome, UnitTask};
use crate::store::{ArtifactStore, is_complete};
use crate::tools::ExternalTools;

pub const IMPLICIT_GROUP: &str = "all_samples";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreatmentGroup {
    pub name: String,
    pub members: Vec<SampleId>,
}

/// Parsed `group:sampleA,sampleB;group2:sampleC` specification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GroupSpec {
    /// No specification given: one group holding every discovered sample.
    #[default]
    Implicit,
    Explicit(Vec<TreatmentGroup>),
}

impl GroupSpec {
    pub fn is_implicit(&self) -> bool {
        matches!(self, GroupSpec::Implicit)
    }

    pub fn resolve(&self, samples: &[Sample]) -> Vec<TreatmentGroup> {
        match self {
            GroupSpec::Implicit => vec![TreatmentGroup {
                name: IMPLICIT_GROUP.to_string(),
                members: samples.iter().map(|sample| sample.id.clone()).collect(),
            }],
            GroupSpec::Explicit(groups) => groups.clone(),
        }
    }
}

impl FromStr for GroupSpec {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Ok(GroupSpec::Implicit);
        }

        let mut groups: Vec<TreatmentGroup> = Vec::new();
        for entry in value.split(';').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (name, members) = entry
                .split_once(':')
                .ok_or_else(|| PipelineError::InvalidGroupSpec(format!("`{entry}` has no ':'")))?;
            let name = name.trim();
            let name_ok = !name.is_empty()
                && name
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
                && name.chars().any(|ch| ch != '.');
            if !name_ok {
                return Err(PipelineError::InvalidGroupSpec(format!(
                    "invalid group name `{name}`"
                )));
            }
            if groups.iter().any(|group| group.name == name) {
                return Err(PipelineError::InvalidGroupSpec(format!(
                    "group `{name}` defined twice"
                )));
            }

            let mut ids: Vec<SampleId> = Vec::new();
            for raw in members.split(',').map(str::trim).filter(|raw| !raw.is_empty()) {
                let id: SampleId = raw
                    .parse()
                    .map_err(|_| PipelineError::InvalidGroupSpec(format!("invalid sample `{raw}`")))?;
                if ids.contains(&id) {
                    warn!(group = name, sample = %id, "sample listed twice in group; keeping one");
                    continue;
                }
                ids.push(id);
            }
            if ids.is_empty() {
                return Err(PipelineError::InvalidGroupSpec(format!(
                    "group `{name}` has no samples"
                )));
            }
            groups.push(TreatmentGroup {
                name: name.to_string(),
                members: ids,
            });
        }

        if groups.is_empty() {
            return Ok(GroupSpec::Implicit);
        }
        warn_shared_members(&groups);
        Ok(GroupSpec::Explicit(groups))
    }
}

/// Shared membership is allowed; each group is combined on its own.
fn warn_shared_members(groups: &[TreatmentGroup]) {
    let mut owners: BTreeMap<&SampleId, Vec<&str>> = BTreeMap::new();
    for group in groups {
        for member in &group.members {
            owners.entry(member).or_default().push(group.name.as_str());
        }
    }
    for (sample, names) in owners.into_iter().filter(|(_, names)| names.len() > 1) {
        warn!(sample = %sample, groups = ?names, "sample belongs to more than one group");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelCombination {
    pub level: TaxonLevel,
    pub output: Option<Utf8PathBuf>,
    pub included: Vec<SampleId>,
    pub excluded: Vec<SampleId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub name: String,
    pub members: Vec<SampleId>,
    pub levels: Vec<LevelCombination>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupManifest {
    pub generated_at: String,
    pub groups: Vec<GroupReport>,
    pub skipped: Vec<String>,
}

/// Combines per-sample level summaries into one table per (group, level).
/// Members without a summary are left out with a warning, and a group/level
/// with no usable member is skipped. The manifest is only written when every
/// attempted combination succeeded.
pub fn summarize_groups(
    store: &ArtifactStore,
    samples: &[Sample],
    spec: &GroupSpec,
    tools: &dyn ExternalTools,
) -> Result<UnitOutcome, PipelineError> {
    let task = UnitTask::new("group-summary", Vec::new(), vec![store.group_manifest()]);
    UnitExecutor::run(&task, &|temps: &[Utf8PathBuf]| {
        let manifest = combine_all(store, samples, spec, tools)?;
        let content = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        std::fs::write(temps[0].as_std_path(), content)
            .map_err(|err| PipelineError::Filesystem(format!("write {}: {err}", temps[0])))
    })
}

fn combine_all(
    store: &ArtifactStore,
    samples: &[Sample],
    spec: &GroupSpec,
    tools: &dyn ExternalTools,
) -> Result<GroupManifest, PipelineError> {
    let known: BTreeSet<&SampleId> = samples.iter().map(|sample| &sample.id).collect();
    let mut reports = Vec::new();
    let mut skipped = Vec::new();
    let mut failures = 0usize;

    for group in spec.resolve(samples) {
        for member in group.members.iter().filter(|id| !known.contains(id)) {
            warn!(group = %group.name, sample = %member, "group member was not discovered");
        }

        let mut levels = Vec::new();
        for level in store.levels().iter().copied() {
            let mut included = Vec::new();
            let mut excluded = Vec::new();
            for member in &group.members {
                let path = store.level_summary(member, level);
                if known.contains(member) && is_complete(&path) {
                    included.push((member.clone(), path));
                } else {
                    if known.contains(member) {
                        warn!(group = %group.name, sample = %member, %level, "no level summary; excluded");
                    }
                    excluded.push(member.clone());
                }
            }

            if included.is_empty() {
                warn!(group = %group.name, %level, "no member has a summary; combination skipped");
                skipped.push(format!("{}/{level}", group.name));
                levels.push(LevelCombination {
                    level,
                    output: None,
                    included: Vec::new(),
                    excluded,
                });
                continue;
            }

            let output = store.group_output(&group.name, level);
            let task = UnitTask::new(
                format!("group-summary:{}:{level}", group.name),
                included.iter().map(|(_, path)| path.clone()).collect(),
                vec![output.clone()],
            );
            let result = UnitExecutor::run(&task, &|temps: &[Utf8PathBuf]| {
                tools.combine(&included, &temps[0])
            });
            match result {
                Ok(UnitOutcome::Completed | UnitOutcome::AlreadyComplete) => {}
                Ok(UnitOutcome::LockedElsewhere) => {
                    warn!(group = %group.name, %level, "combination held by another task");
                    failures += 1;
                }
                Err(err) => {
                    error!(group = %group.name, %level, error = %err, "combination failed");
                    failures += 1;
                }
            }
            levels.push(LevelCombination {
                level,
                output: Some(output),
                included: included.into_iter().map(|(id, _)| id).collect(),
                excluded,
            });
        }

        reports.push(GroupReport {
            name: group.name,
            members: group.members,
            levels,
        });
    }

    if failures > 0 {
        return Err(PipelineError::GroupCombination(failures));
    }
    info!(groups = reports.len(), skipped = skipped.len(), "groups summarized");
    Ok(GroupManifest {
        generated_at: chrono::Utc::now().to_rfc3339(),
        groups: reports,
        skipped,
    })
}
