use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolveConfig {
    pub task: TaskConfig,
    #[serde(default = "default_population")]
    pub population_size: usize,
    #[serde(default = "default_generations")]
    pub generations: i64,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricSpec>,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub cascade: CascadeConfig,
    #[serde(default)]
    pub meta_prompt: MetaPromptConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_artifacts_root")]
    pub artifacts_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub workdir: PathBuf,
    pub target_file: PathBuf,
    #[serde(default)]
    pub description: String,
    /// Restrict mutation to these block names. `None` means every block in
    /// the file is fair game.
    #[serde(default)]
    pub evolve_blocks: Option<Vec<String>>,
}

impl TaskConfig {
    pub fn target_path(&self) -> PathBuf {
        self.workdir.join(&self.target_file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Maximize,
    Minimize,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Maximize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSpec {
    #[serde(default)]
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub elite: usize,
    pub novel: usize,
    pub young: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            elite: 2,
            novel: 2,
            young: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub budget_tokens: usize,
    pub elites_k: usize,
    pub novel_m: usize,
    /// How many recent failed candidates to include as counter-examples.
    pub include_failures: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 4000,
            elites_k: 4,
            novel_m: 4,
            include_failures: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Blocks,
    Wholefile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    pub scope: Scope,
    pub apply_safe_revert: bool,
    pub max_concurrent_slots: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            scope: Scope::Blocks,
            apply_safe_revert: true,
            max_concurrent_slots: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    pub max_parallel: usize,
    pub cancel_on_fail: bool,
    #[serde(default)]
    pub evaluators: Vec<EvaluatorSpec>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            cancel_on_fail: false,
            evaluators: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorSpec {
    pub name: String,
    /// argv; the candidate file path is appended as the last argument.
    pub command: Vec<String>,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default)]
    pub retries: u32,
    /// Items sharing a stage value run concurrently; distinct values run in
    /// ascending order. Defaults to one stage per item in list order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaPromptConfig {
    pub population: usize,
    pub mutation_prob: f64,
    pub selection_top_k: usize,
}

impl Default for MetaPromptConfig {
    fn default() -> Self {
        Self {
            population: 8,
            mutation_prob: 0.3,
            selection_top_k: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub capacity: usize,
    pub k_novelty: usize,
    pub ageing_threshold: i64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            k_novelty: 10,
            ageing_threshold: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmMode {
    Echo,
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub mode: LlmMode,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed response body for `mode: echo`.
    #[serde(default)]
    pub response: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            mode: LlmMode::Echo,
            model: String::new(),
            temperature: default_temperature(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_s: default_llm_timeout_s(),
            max_retries: default_max_retries(),
            response: String::new(),
        }
    }
}

fn default_population() -> usize {
    8
}
fn default_generations() -> i64 {
    1
}
fn default_db_path() -> PathBuf {
    PathBuf::from(".evolve/evolve.db")
}
fn default_artifacts_root() -> PathBuf {
    PathBuf::from("runs")
}
fn default_timeout_s() -> u64 {
    30
}
fn default_temperature() -> f32 {
    0.7
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_llm_timeout_s() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

pub fn load_config(path: &Path) -> Result<EvolveConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;
    let mut cfg: EvolveConfig = serde_yaml::from_str(&raw)
        .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;

    normalize_paths(&mut cfg, path);
    validate(&cfg)?;
    Ok(cfg)
}

/// Resolve task paths relative to the config file's directory.
fn normalize_paths(cfg: &mut EvolveConfig, config_path: &Path) {
    let base = config_path.parent().unwrap_or(Path::new("."));
    if cfg.task.workdir.is_relative() {
        cfg.task.workdir = base.join(&cfg.task.workdir);
    }
    if cfg.db_path.is_relative() {
        cfg.db_path = base.join(&cfg.db_path);
    }
    if cfg.artifacts_root.is_relative() {
        cfg.artifacts_root = base.join(&cfg.artifacts_root);
    }
}

pub fn validate(cfg: &EvolveConfig) -> Result<(), ConfigError> {
    if cfg.population_size == 0 {
        return Err(ConfigError("population_size must be at least 1".into()));
    }
    if cfg.generations < 1 {
        return Err(ConfigError("generations must be at least 1".into()));
    }
    if !cfg.task.target_path().is_file() {
        return Err(ConfigError(format!(
            "task target file {} does not exist",
            cfg.task.target_path().display()
        )));
    }
    if cfg.cascade.max_parallel == 0 {
        return Err(ConfigError("cascade.max_parallel must be at least 1".into()));
    }
    for ev in &cfg.cascade.evaluators {
        if ev.command.is_empty() {
            return Err(ConfigError(format!("evaluator '{}' has an empty command", ev.name)));
        }
        if ev.timeout_s == 0 {
            return Err(ConfigError(format!("evaluator '{}' has a zero timeout", ev.name)));
        }
    }
    if !cfg.cascade.evaluators.is_empty() && cfg.metrics.is_empty() {
        return Err(ConfigError(
            "metrics must be declared when evaluators are configured".into(),
        ));
    }
    for (name, spec) in &cfg.metrics {
        if let Some(t) = spec.threshold {
            if !t.is_finite() {
                return Err(ConfigError(format!("metric '{}' has a non-finite threshold", name)));
            }
        }
    }
    if !(0.0..=1.0).contains(&cfg.meta_prompt.mutation_prob) {
        return Err(ConfigError("meta_prompt.mutation_prob must be in [0, 1]".into()));
    }
    if cfg.meta_prompt.population == 0 || cfg.meta_prompt.selection_top_k == 0 {
        return Err(ConfigError(
            "meta_prompt.population and selection_top_k must be at least 1".into(),
        ));
    }
    if cfg.archive.capacity == 0 || cfg.archive.k_novelty == 0 {
        return Err(ConfigError(
            "archive.capacity and k_novelty must be at least 1".into(),
        ));
    }
    if cfg.evolution.max_concurrent_slots == 0 {
        return Err(ConfigError("evolution.max_concurrent_slots must be at least 1".into()));
    }
    Ok(())
}

pub fn write_sample_config(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(
        path,
        r#"task:
  workdir: tasks/toy_sum_squares
  target_file: program.py
  description: "Minimise error when computing the sum of squares for integer lists."

population_size: 4
generations: 3
seed: 42

metrics:
  correct:
    direction: maximize
    threshold: 1.0

selection:
  elite: 2
  novel: 2
  young: 1

sampler:
  budget_tokens: 4000
  elites_k: 4
  novel_m: 4
  include_failures: 2

evolution:
  scope: blocks
  apply_safe_revert: true
  max_concurrent_slots: 4

cascade:
  max_parallel: 4
  cancel_on_fail: true
  evaluators:
    - name: tests
      command: ["python", "evaluate.py"]
      timeout_s: 30
      retries: 0

meta_prompt:
  population: 8
  mutation_prob: 0.3
  selection_top_k: 3

archive:
  capacity: 200
  k_novelty: 10
  ageing_threshold: 8

llm:
  mode: echo
  response: "{\"diffs\": []}"
"#,
    )
    .map_err(|e| ConfigError(format!("failed to write sample config: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_sections() {
        let yaml = r#"
task:
  workdir: /tmp
  target_file: program.py
"#;
        let cfg: EvolveConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.population_size, 8);
        assert_eq!(cfg.evolution.scope, Scope::Blocks);
        assert!(cfg.evolution.apply_safe_revert);
        assert_eq!(cfg.archive.capacity, 200);
        assert_eq!(cfg.llm.mode, LlmMode::Echo);
    }

    #[test]
    fn direction_parses_lowercase() {
        let yaml = r#"
task:
  workdir: /tmp
  target_file: program.py
metrics:
  acc:
    direction: maximize
  latency:
    direction: minimize
    threshold: 50.0
"#;
        let cfg: EvolveConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.metrics["acc"].direction, Direction::Maximize);
        assert_eq!(cfg.metrics["latency"].direction, Direction::Minimize);
        assert_eq!(cfg.metrics["latency"].threshold, Some(50.0));
    }

    #[test]
    fn validate_rejects_missing_metrics_with_evaluators() {
        let yaml = r#"
task:
  workdir: /tmp
  target_file: program.py
cascade:
  max_parallel: 2
  cancel_on_fail: false
  evaluators:
    - name: tests
      command: ["true"]
"#;
        let mut cfg: EvolveConfig = serde_yaml::from_str(yaml).expect("parse");
        // point at a file that exists so only the metrics check can fail
        cfg.task.workdir = std::env::temp_dir();
        cfg.task.target_file = PathBuf::from("evolve-config-test-target.py");
        std::fs::write(cfg.task.target_path(), "x = 1\n").unwrap();
        let err = validate(&cfg).unwrap_err();
        assert!(err.0.contains("metrics"));
    }
}
