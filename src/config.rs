use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::template::TemplateContract;

const DEFAULT_SPLIT: &str = "test";
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_TEMPERATURE: f32 = 0.2;
const DEFAULT_TOP_P: f32 = 0.95;
const DEFAULT_MAX_TOKENS: u32 = 512;
const DEFAULT_NUM_SAMPLES: usize = 1;
const DEFAULT_PASS_AT_K: usize = 1;
const DEFAULT_EXEC_TIMEOUT: u64 = 10;
const DEFAULT_PYTHON: &str = "python3";
const DEFAULT_WORKSPACE_BASE: &str = "/tmp/gen-eval";

/// Command-line arguments. Every option can also come from the environment
/// or from the YAML file given with `--config`.
#[derive(Parser, Debug, Default)]
#[command(name = "gen-eval", version, about = "Generate, normalize and score model outputs over a dataset")]
pub struct Cli {
    /// YAML config file, flat or with one level of sections
    #[arg(long, env = "GEN_EVAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// `.jsonl` file or HuggingFace dataset id; built-in dummy data when unset
    #[arg(long, env = "DATASET")]
    pub dataset: Option<String>,
    /// HuggingFace dataset config name
    #[arg(long, env = "DATASET_NAME")]
    pub dataset_name: Option<String>,
    #[arg(long, env = "DATASET_SPLIT")]
    pub split: Option<String>,
    #[arg(long, env = "DATASET_LIMIT")]
    pub dataset_limit: Option<usize>,

    /// Template contract file (.json or .yaml)
    #[arg(long, env = "TEMPLATE")]
    pub template: Option<PathBuf>,
    #[arg(long, env = "PROMPT_TEMPLATE")]
    pub prompt_template: Option<String>,
    #[arg(long, env = "REFERENCE_TEMPLATE")]
    pub reference_template: Option<String>,
    #[arg(long, env = "OUTPUT_LANG")]
    pub output_lang: Option<String>,
    #[arg(long, env = "OUTPUT_FORMAT")]
    pub format: Option<String>,
    #[arg(long, env = "BEGIN_MARKER")]
    pub begin_marker: Option<String>,
    #[arg(long, env = "END_MARKER")]
    pub end_marker: Option<String>,
    #[arg(long, env = "EXTRACT_BEGIN")]
    pub extract_begin: Option<String>,
    #[arg(long, env = "EXTRACT_END")]
    pub extract_end: Option<String>,

    /// `dummy` or `openai:<model>`
    #[arg(long, env = "MODEL")]
    pub model: Option<String>,
    #[arg(long, env = "OPENAI_BASE_URL")]
    pub api_base: Option<String>,
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    #[arg(long, env = "TEMPERATURE")]
    pub temperature: Option<f32>,
    #[arg(long, env = "TOP_P")]
    pub top_p: Option<f32>,
    #[arg(long, env = "MAX_TOKENS")]
    pub max_tokens: Option<u32>,
    /// Completions generated per prompt
    #[arg(short = 'n', long = "n", env = "NUM_RETURN_SEQUENCES")]
    pub n: Option<usize>,

    /// Comma-separated metric ids (exact_match, pass@1, pass@k, format_check)
    #[arg(long, env = "METRICS")]
    pub metrics: Option<String>,
    #[arg(long, env = "PASS_AT_K")]
    pub pass_at_k: Option<usize>,

    #[arg(long, env = "RESULT_PATH")]
    pub result_path: Option<PathBuf>,
    /// Continue from an existing result store (`--resume=false` starts over)
    #[arg(long, env = "RESUME", num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub resume: Option<bool>,
    /// Only process the first records and write to a `_test_run` path
    #[arg(long, env = "TEST_RUN", num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub test_run: Option<bool>,

    #[arg(long, env = "EXEC_TIMEOUT_SECS")]
    pub exec_timeout_secs: Option<u64>,
    #[arg(long, env = "PYTHON")]
    pub python: Option<String>,
    #[arg(long, env = "WORKSPACE_BASE")]
    pub workspace_base: Option<PathBuf>,

    #[arg(short, long, env = "VERBOSE", num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub verbose: Option<bool>,
}

/// Metric list in a config file, either `"a,b"` or a YAML sequence.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MetricList {
    Joined(String),
    List(Vec<String>),
}

impl MetricList {
    fn into_ids(self) -> Vec<String> {
        match self {
            MetricList::Joined(s) => split_metrics(&s),
            MetricList::List(ids) => ids
                .into_iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }
}

/// Values read from the YAML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    dataset: Option<String>,
    dataset_name: Option<String>,
    split: Option<String>,
    dataset_limit: Option<usize>,
    template: Option<PathBuf>,
    prompt_template: Option<String>,
    reference_template: Option<String>,
    output_lang: Option<String>,
    #[serde(alias = "output_format")]
    format: Option<String>,
    begin_marker: Option<String>,
    end_marker: Option<String>,
    extract_begin: Option<String>,
    extract_end: Option<String>,
    #[serde(alias = "model_path")]
    model: Option<String>,
    api_base: Option<String>,
    #[serde(alias = "openai_api_key")]
    api_key: Option<String>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    #[serde(alias = "max_length")]
    max_tokens: Option<u32>,
    #[serde(alias = "num_return_sequences")]
    n: Option<usize>,
    metrics: Option<MetricList>,
    #[serde(alias = "k")]
    pass_at_k: Option<usize>,
    #[serde(alias = "record_path")]
    result_path: Option<PathBuf>,
    resume: Option<bool>,
    test_run: Option<bool>,
    exec_timeout_secs: Option<u64>,
    python: Option<String>,
    workspace_base: Option<PathBuf>,
    verbose: Option<bool>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let value: serde_yaml::Value = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid YAML in {}", path.display()))?;
        serde_yaml::from_value(flatten_sections(value))
            .with_context(|| format!("Invalid config values in {}", path.display()))
    }
}

/// Lift the keys of nested mappings one level up. Top-level keys win over
/// keys of the same name inside a section.
fn flatten_sections(value: serde_yaml::Value) -> serde_yaml::Value {
    let serde_yaml::Value::Mapping(map) = value else {
        return serde_yaml::Value::Mapping(Default::default());
    };
    let mut flat = serde_yaml::Mapping::new();
    let mut nested = Vec::new();
    for (key, value) in map {
        match value {
            serde_yaml::Value::Mapping(section) => nested.push(section),
            other => {
                flat.insert(key, other);
            }
        }
    }
    for section in nested {
        for (key, value) in section {
            if !flat.contains_key(&key) {
                flat.insert(key, value);
            }
        }
    }
    serde_yaml::Value::Mapping(flat)
}

fn split_metrics(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// Options resolved once at startup: argument > environment > config file > default.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub dataset: Option<String>,
    pub dataset_name: Option<String>,
    pub split: String,
    pub dataset_limit: Option<usize>,
    pub template_file: Option<PathBuf>,
    pub template: TemplateContract,
    pub model: Option<String>,
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub n: usize,
    pub metrics: Vec<String>,
    pub pass_at_k: usize,
    pub result_path: Option<PathBuf>,
    pub resume: bool,
    pub test_run: bool,
    pub exec_timeout_secs: u64,
    pub python: String,
    pub workspace_base: PathBuf,
    pub verbose: bool,
}

impl Config {
    pub fn resolve(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let template = TemplateContract {
            template: cli.prompt_template.or(file.prompt_template),
            reference: cli.reference_template.or(file.reference_template),
            output_lang: cli.output_lang.or(file.output_lang),
            format: cli.format.or(file.format),
            begin_marker: cli.begin_marker.or(file.begin_marker),
            end_marker: cli.end_marker.or(file.end_marker),
            extract_begin: cli.extract_begin.or(file.extract_begin),
            extract_end: cli.extract_end.or(file.extract_end),
            wrapper_tag: None,
        };

        let n = cli.n.or(file.n).unwrap_or(DEFAULT_NUM_SAMPLES);
        if n == 0 {
            anyhow::bail!("n must be at least 1");
        }
        let pass_at_k = cli.pass_at_k.or(file.pass_at_k).unwrap_or(DEFAULT_PASS_AT_K);
        if pass_at_k == 0 || pass_at_k > n {
            anyhow::bail!("pass_at_k must be between 1 and n ({}), got {}", n, pass_at_k);
        }

        let metrics = match cli.metrics {
            Some(s) => split_metrics(&s),
            None => file.metrics.map(MetricList::into_ids).unwrap_or_default(),
        };

        Ok(Self {
            dataset: cli.dataset.or(file.dataset),
            dataset_name: cli.dataset_name.or(file.dataset_name),
            split: cli.split.or(file.split).unwrap_or_else(|| DEFAULT_SPLIT.into()),
            dataset_limit: cli.dataset_limit.or(file.dataset_limit),
            template_file: cli.template.or(file.template),
            template,
            model: cli.model.or(file.model),
            api_base: cli
                .api_base
                .or(file.api_base)
                .unwrap_or_else(|| DEFAULT_API_BASE.into()),
            api_key: cli.api_key.or(file.api_key),
            temperature: cli.temperature.or(file.temperature).unwrap_or(DEFAULT_TEMPERATURE),
            top_p: cli.top_p.or(file.top_p).unwrap_or(DEFAULT_TOP_P),
            max_tokens: cli.max_tokens.or(file.max_tokens).unwrap_or(DEFAULT_MAX_TOKENS),
            n,
            metrics,
            pass_at_k,
            result_path: cli.result_path.or(file.result_path),
            resume: cli.resume.or(file.resume).unwrap_or(true),
            test_run: cli.test_run.or(file.test_run).unwrap_or(false),
            exec_timeout_secs: cli
                .exec_timeout_secs
                .or(file.exec_timeout_secs)
                .unwrap_or(DEFAULT_EXEC_TIMEOUT),
            python: cli.python.or(file.python).unwrap_or_else(|| DEFAULT_PYTHON.into()),
            workspace_base: cli
                .workspace_base
                .or(file.workspace_base)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE_BASE)),
            verbose: cli.verbose.or(file.verbose).unwrap_or(false),
        })
    }

    /// Where records are stored: the configured path, or
    /// `<dataset_id>_<model_id>.jsonl`, rewritten for test runs.
    pub fn result_path_for(&self, dataset_id: &str, model_id: &str) -> PathBuf {
        let path = match &self.result_path {
            Some(p) => p.clone(),
            None => PathBuf::from(format!("{}_{}.jsonl", dataset_id, model_id).replace('/', "_")),
        };
        if self.test_run {
            test_run_path(&path)
        } else {
            path
        }
    }

    pub fn print_banner(&self) {
        let or_unset = |v: &Option<String>| v.clone().unwrap_or_else(|| "(unset)".into());
        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║             gen-eval v{:<27}║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Dataset:           {:<28}║", self.dataset.as_deref().unwrap_or("dummy"));
        tracing::info!("║  Split:             {:<28}║", self.split);
        tracing::info!("║  Model:             {:<28}║", self.model.as_deref().unwrap_or("dummy"));
        tracing::info!("║  Samples (n):       {:<28}║", self.n);
        tracing::info!("║  Output format:     {:<28}║", or_unset(&self.template.format));
        tracing::info!("║  Output lang:       {:<28}║", or_unset(&self.template.output_lang));
        tracing::info!("║  Metrics:           {:<28}║", if self.metrics.is_empty() { "none".to_string() } else { self.metrics.join(",") });
        tracing::info!("║  Resume:            {:<28}║", self.resume);
        tracing::info!("║  Test run:          {:<28}║", self.test_run);
        tracing::info!("║  Exec timeout:      {:<27}s║", self.exec_timeout_secs);
        tracing::info!("║  Workspace:         {:<28}║", self.workspace_base.display());
        tracing::info!("╚══════════════════════════════════════════════════╝");
    }
}

/// `<stem>_test_run.<ext>` in the same directory; only the file name changes.
fn test_run_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}_test_run.{}", stem, ext.to_string_lossy()),
        None => format!("{}_test_run", stem),
    };
    path.with_file_name(name)
}
