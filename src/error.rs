use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("invalid sample id: {0}")]
    InvalidSampleId(String),

    #[error("invalid KEGG orthology id: {0}")]
    InvalidKoId(String),

    #[error("invalid taxonomic level: {0}")]
    InvalidLevel(String),

    #[error("invalid stage name: {0}")]
    InvalidStage(String),

    #[error("missing config file kira-kp.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("missing required config value: {0}")]
    #[diagnostic(help("set `{0}` in kira-kp.json"))]
    MissingConfigValue(String),

    #[error("invalid treatment group specification: {0}")]
    #[diagnostic(help("expected `group:sampleA,sampleB;group2:sampleC`"))]
    InvalidGroupSpec(String),

    #[error("stage graph contains a cycle through {0}")]
    StageCycle(String),

    #[error("no paired samples found in {0}")]
    NoSamples(Utf8PathBuf),

    #[error("array index {index} out of range for {count} samples")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("stage {0} needs an array index")]
    MissingIndex(String),

    #[error("missing input for {unit}: {path}")]
    InputMissing { unit: String, path: Utf8PathBuf },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("{unit} reported success but produced no data at {path}")]
    EmptyArtifact { unit: String, path: Utf8PathBuf },

    #[error("genome equivalent for {sample} is not positive: {value}")]
    NonPositiveGenomeEquivalent { sample: String, value: f64 },

    #[error("genome equivalent for {0} is undefined")]
    MissingGenomeEquivalent(String),

    #[error("KO table has no rows: {0}")]
    EmptyKoTable(String),

    #[error("no gene to KO assignments found in {0}")]
    #[diagnostic(help("check `databases.kegg_annotations`; each line needs `gene_id<TAB>... K#####`"))]
    EmptyAnnotations(Utf8PathBuf),

    #[error("malformed table {path}: {message}")]
    MalformedTable { path: Utf8PathBuf, message: String },

    #[error("{0} group combination(s) failed")]
    GroupCombination(usize),

    #[error("scheduler submission failed: {0}")]
    Scheduler(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
