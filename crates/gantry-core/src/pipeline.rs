//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline configuration. Every job
//! field is optional so that `extends` can fill it in from templates; the
//! scheduler crate linearizes the inheritance chain into immutable templates.

use crate::duration::parse_timeout;
use crate::trigger::EventSource;
use crate::Error;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Ordered variable mapping as authored.
pub type VariableMap = IndexMap<String, VariableValue>;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineConfig {
    /// Ordered stage names. Empty disables stage gating.
    #[serde(default)]
    pub stages: Vec<String>,
    /// Global default variables.
    #[serde(default)]
    pub variables: VariableMap,
    /// Defaults applied beneath every job's inheritance chain.
    #[serde(default)]
    pub default: JobDefaults,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Job definitions keyed by name. Names starting with `.` are hidden templates.
    pub jobs: IndexMap<String, JobDefinition>,
}

/// Job-level defaults (the lowest inheritance layer).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct JobDefaults {
    #[serde(default)]
    pub before_script: Option<OneOrMany<String>>,
    #[serde(default)]
    pub after_script: Option<OneOrMany<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub interruptible: Option<bool>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowConfig {
    /// Whether runs of this pipeline may be canceled by a newer run on the same ref.
    #[serde(default = "default_true")]
    pub interruptible: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            interruptible: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    #[serde(default)]
    pub extends: Option<OneOrMany<String>>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub rules: Option<Vec<RuleConfig>>,
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub before_script: Option<OneOrMany<String>>,
    #[serde(default)]
    pub script: Option<OneOrMany<String>>,
    #[serde(default)]
    pub after_script: Option<OneOrMany<String>>,
    #[serde(default)]
    pub artifacts: Option<ArtifactConfig>,
    /// `None` means "not declared" (stage gating applies); `Some([])` makes a root.
    #[serde(default)]
    pub needs: Option<Vec<NeedConfig>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub interruptible: Option<bool>,
    #[serde(default)]
    pub allow_failure: Option<bool>,
    #[serde(default)]
    pub when: Option<WhenPolicy>,
    #[serde(default)]
    pub parallel: Option<ParallelConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// A single value or a list of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

/// Scalar accepted wherever the configuration expects a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(b) => write!(f, "{}", b),
            ScalarValue::Int(i) => write!(f, "{}", i),
            ScalarValue::Float(x) => write!(f, "{}", x),
            ScalarValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(s: &str) -> Self {
        ScalarValue::String(s.to_string())
    }
}

/// Variable value, either bare or with a description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum VariableValue {
    Plain(ScalarValue),
    Described {
        value: ScalarValue,
        #[serde(default)]
        description: Option<String>,
    },
}

impl VariableValue {
    pub fn render(&self) -> String {
        match self {
            VariableValue::Plain(v) => v.to_string(),
            VariableValue::Described { value, .. } => value.to_string(),
        }
    }
}

impl From<&str> for VariableValue {
    fn from(s: &str) -> Self {
        VariableValue::Plain(ScalarValue::from(s))
    }
}

/// When a job runs relative to its predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WhenPolicy {
    #[default]
    OnSuccess,
    OnFailure,
    Manual,
    Always,
    /// Only meaningful inside a rule: a match excludes the job.
    Never,
}

impl fmt::Display for WhenPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WhenPolicy::OnSuccess => "on_success",
            WhenPolicy::OnFailure => "on_failure",
            WhenPolicy::Manual => "manual",
            WhenPolicy::Always => "always",
            WhenPolicy::Never => "never",
        };
        f.write_str(s)
    }
}

/// One entry of a job's `rules` list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RuleConfig {
    /// Predicate over the trigger context. Absent means "always matches".
    /// Written as a single-key map (`if: { branch: main }`), nested the same way.
    #[serde(
        rename = "if",
        default,
        with = "serde_yaml::with::singleton_map_recursive"
    )]
    #[schemars(with = "Option<Condition>")]
    pub condition: Option<Condition>,
    /// Path globs; the rule matches only if a changed file matches one of them.
    #[serde(default)]
    pub changes: Option<Vec<String>>,
    #[serde(default)]
    pub when: Option<WhenPolicy>,
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub allow_failure: Option<bool>,
}

/// Tagged predicate over the trigger context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Pipeline source is one of the listed events.
    Event(Vec<EventSource>),
    /// Ref name matches a glob.
    Branch(String),
    /// Scheduled pipeline with the given name.
    Schedule(String),
    /// Merge request targeting a branch matching a glob.
    MergeRequestTarget(String),
    /// Commit message matches a regular expression.
    CommitMessage(String),
    /// Trigger variable test.
    Variable(VariablePredicate),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

/// `equals` and `matches` are exclusive; with neither, the variable must exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VariablePredicate {
    pub name: String,
    #[serde(default)]
    pub equals: Option<String>,
    #[serde(default)]
    pub matches: Option<String>,
}

/// A `needs` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum NeedConfig {
    Job(String),
    Detailed {
        job: String,
        /// Pins specific matrix cells of the needed job.
        #[serde(default)]
        matrix: Vec<IndexMap<String, ScalarValue>>,
        /// Download the needed job's artifacts.
        #[serde(default = "default_true")]
        artifacts: bool,
        /// When false, the needed job must be part of the pipeline.
        #[serde(default = "default_true")]
        optional: bool,
    },
}

impl NeedConfig {
    pub fn job(&self) -> &str {
        match self {
            NeedConfig::Job(name) => name,
            NeedConfig::Detailed { job, .. } => job,
        }
    }
}

/// `parallel: N` or `parallel: { matrix: [...] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ParallelConfig {
    Count(u32),
    Matrix {
        matrix: Vec<IndexMap<String, OneOrMany<ScalarValue>>>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactConfig {
    #[serde(default)]
    pub paths: Vec<String>,
    /// Structured report files keyed by report type, e.g. `junit`.
    #[serde(default)]
    pub reports: IndexMap<String, Vec<String>>,
    /// Missing paths fail the job instead of only warning.
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RetryConfig {
    Count(u32),
    Detailed {
        max: u32,
        #[serde(default)]
        when: Vec<RetryWhen>,
    },
}

impl RetryConfig {
    pub fn max(&self) -> u32 {
        match self {
            RetryConfig::Count(n) => *n,
            RetryConfig::Detailed { max, .. } => *max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RetryWhen {
    Always,
    ScriptFailure,
    Timeout,
    ArtifactsMissing,
    RunnerFailure,
}

/// Retry bound accepted by the configuration.
pub const MAX_RETRIES: u32 = 2;

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate pipeline configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation that does not need inheritance resolved.
    ///
    /// Inheritance cycles and unknown `extends` targets are reported by the
    /// template catalog, which walks the chains.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen_stages = HashSet::new();
        for stage in &self.stages {
            if !seen_stages.insert(stage.as_str()) {
                return Err(Error::Config(format!("Duplicate stage: {}", stage)));
            }
        }

        if let Some(timeout) = &self.default.timeout {
            parse_timeout(timeout)?;
        }
        if let Some(retry) = &self.default.retry {
            validate_retry("default", retry)?;
        }

        for (name, job) in &self.jobs {
            if name.trim().is_empty() {
                return Err(Error::Config("Job name must not be empty".to_string()));
            }

            if let Some(stage) = &job.stage
                && !self.stages.is_empty()
                && !seen_stages.contains(stage.as_str())
            {
                return Err(Error::Config(format!(
                    "Job '{}' uses undeclared stage '{}'",
                    name, stage
                )));
            }

            if let Some(parents) = &job.extends {
                for parent in parents.to_vec() {
                    if !self.jobs.contains_key(&parent) {
                        return Err(Error::Config(format!(
                            "Job '{}' extends unknown template '{}'",
                            name, parent
                        )));
                    }
                }
            }

            for need in job.needs.iter().flatten() {
                let target = need.job();
                if target.starts_with('.') || !self.jobs.contains_key(target) {
                    return Err(Error::Config(format!(
                        "Job '{}' needs unknown job '{}'",
                        name, target
                    )));
                }
            }

            if let Some(timeout) = &job.timeout {
                parse_timeout(timeout)?;
            }
            if let Some(retry) = &job.retry {
                validate_retry(name, retry)?;
            }

            for rule in job.rules.iter().flatten() {
                if let Some(condition) = &rule.condition {
                    validate_condition(name, condition)?;
                }
            }
        }

        Ok(())
    }

    /// Jobs that can be scheduled (hidden templates excluded), in declaration order.
    pub fn visible_jobs(&self) -> impl Iterator<Item = (&String, &JobDefinition)> {
        self.jobs.iter().filter(|(name, _)| !name.starts_with('.'))
    }
}

fn validate_retry(owner: &str, retry: &RetryConfig) -> crate::Result<()> {
    if retry.max() > MAX_RETRIES {
        return Err(Error::Config(format!(
            "Job '{}' retries {} times; at most {} retries are allowed",
            owner,
            retry.max(),
            MAX_RETRIES
        )));
    }
    Ok(())
}

fn validate_condition(job: &str, condition: &Condition) -> crate::Result<()> {
    match condition {
        Condition::Variable(predicate) => {
            if predicate.equals.is_some() && predicate.matches.is_some() {
                return Err(Error::Config(format!(
                    "Job '{}' variable predicate on '{}' sets both equals and matches",
                    job, predicate.name
                )));
            }
            Ok(())
        }
        Condition::All(items) | Condition::Any(items) => {
            if items.is_empty() {
                return Err(Error::Config(format!(
                    "Job '{}' has an empty composite condition",
                    job
                )));
            }
            items.iter().try_for_each(|c| validate_condition(job, c))
        }
        Condition::Not(inner) => validate_condition(job, inner),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
stages: [build, test]
variables:
  CARGO_TERM_COLOR: always
  RETRIES: 3
jobs:
  .rust:
    variables:
      TOOLCHAIN: stable
    tags: [linux]
  build:
    extends: .rust
    stage: build
    script: cargo build
    rules:
      - if: { event: [schedule] }
        when: manual
      - if: { all: [{ event: [push] }, { branch: "release/*" }] }
        changes: ["src/**/*.rs"]
  test:
    stage: test
    needs: [build]
    script:
      - cargo test
    parallel:
      matrix:
        - OS: [linux, macos]
          RUST: "1.80"
"#;

    #[test]
    fn test_parse_sample_pipeline() {
        let config = PipelineConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.stages, vec!["build", "test"]);
        assert_eq!(config.variables["RETRIES"].render(), "3");
        assert_eq!(config.visible_jobs().count(), 2);

        let build = &config.jobs["build"];
        assert_eq!(build.extends, Some(OneOrMany::One(".rust".to_string())));
        let rules = build.rules.as_ref().unwrap();
        assert_eq!(
            rules[0].condition,
            Some(Condition::Event(vec![EventSource::Schedule]))
        );
        assert_eq!(rules[0].when, Some(WhenPolicy::Manual));
        assert!(matches!(rules[1].condition, Some(Condition::All(ref c)) if c.len() == 2));

        let test = &config.jobs["test"];
        assert_eq!(test.needs, Some(vec![NeedConfig::Job("build".to_string())]));
        match test.parallel.as_ref().unwrap() {
            ParallelConfig::Matrix { matrix } => {
                assert_eq!(matrix.len(), 1);
                assert_eq!(matrix[0].keys().collect::<Vec<_>>(), vec!["OS", "RUST"]);
            }
            other => panic!("unexpected parallel config: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_extends_fails() {
        let yaml = r#"
jobs:
  build:
    extends: .missing
    script: make
"#;
        let err = PipelineConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains(".missing"));
    }

    #[test]
    fn test_unknown_need_fails() {
        let yaml = r#"
jobs:
  test:
    needs: [build]
    script: make test
"#;
        assert!(PipelineConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_undeclared_stage_fails() {
        let yaml = r#"
stages: [build]
jobs:
  deploy:
    stage: deploy
    script: ./deploy.sh
"#;
        assert!(PipelineConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_retry_bound() {
        let yaml = r#"
jobs:
  flaky:
    script: ./flaky.sh
    retry: 5
"#;
        assert!(PipelineConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_detailed_need_defaults() {
        let yaml = r#"
jobs:
  build:
    script: make
    parallel:
      matrix:
        - X: [1, 2]
  test:
    script: make test
    needs:
      - job: build
        matrix:
          - X: 1
"#;
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        match &config.jobs["test"].needs.as_ref().unwrap()[0] {
            NeedConfig::Detailed {
                job,
                matrix,
                artifacts,
                optional,
            } => {
                assert_eq!(job, "build");
                assert_eq!(matrix[0]["X"], ScalarValue::Int(1));
                assert!(*artifacts);
                assert!(*optional);
            }
            other => panic!("expected detailed need, got {:?}", other),
        }
    }

    #[test]
    fn test_when_policy_default() {
        assert_eq!(WhenPolicy::default(), WhenPolicy::OnSuccess);
        assert_eq!(WhenPolicy::Manual.to_string(), "manual");
    }

    #[test]
    fn test_zero_timeout_fails_validation() {
        let yaml = r#"
jobs:
  build:
    script: make
    timeout: 0s
"#;
        let err = PipelineConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("positive"));

        let defaults = "default:\n  timeout: 0m\njobs:\n  build:\n    script: make\n";
        assert!(PipelineConfig::from_yaml(defaults).is_err());
    }

    #[test]
    fn test_nested_condition_map_form() {
        let yaml = r#"
if:
  not:
    any:
      - branch: "release/*"
      - variable: { name: SKIP }
when: always
"#;
        let rule: RuleConfig = serde_yaml::from_str(yaml).unwrap();
        let expected = Condition::Not(Box::new(Condition::Any(vec![
            Condition::Branch("release/*".to_string()),
            Condition::Variable(VariablePredicate {
                name: "SKIP".to_string(),
                equals: None,
                matches: None,
            }),
        ])));
        assert_eq!(rule.condition, Some(expected.clone()));

        let written = serde_yaml::to_string(&rule).unwrap();
        assert!(!written.contains('!'), "unexpected YAML tag in {}", written);
        let reread: RuleConfig = serde_yaml::from_str(&written).unwrap();
        assert_eq!(reread.condition, Some(expected));
    }
}
