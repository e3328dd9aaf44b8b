//! Rule evaluation: deciding whether a job is part of a pipeline.

use gantry_core::Glob;
use crate::templates::JobTemplate;
use gantry_core::pipeline::{Condition, RuleConfig, VariablePredicate, WhenPolicy};
use gantry_core::trigger::{EventSource, TriggerContext};
use gantry_core::{Error, Result};
use indexmap::IndexMap;
use regex::Regex;
use tracing::{debug, warn};

/// Compiled form of [`Condition`]. Globs and regexes are built once at load time.
#[derive(Debug, Clone)]
pub enum Predicate {
    Event(Vec<EventSource>),
    Branch(Glob),
    Schedule(Glob),
    MergeRequestTarget(Glob),
    CommitMessage(Regex),
    Variable { name: String, test: VariableTest },
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

#[derive(Debug, Clone)]
pub enum VariableTest {
    Exists,
    Equals(String),
    Matches(Regex),
}

impl Predicate {
    pub fn compile(condition: &Condition) -> Result<Self> {
        Ok(match condition {
            Condition::Event(sources) => Predicate::Event(sources.clone()),
            Condition::Branch(pattern) => Predicate::Branch(Glob::new(pattern)?),
            Condition::Schedule(pattern) => Predicate::Schedule(Glob::new(pattern)?),
            Condition::MergeRequestTarget(pattern) => {
                Predicate::MergeRequestTarget(Glob::new(pattern)?)
            }
            Condition::CommitMessage(pattern) => Predicate::CommitMessage(compile_regex(pattern)?),
            Condition::Variable(VariablePredicate {
                name,
                equals,
                matches,
            }) => {
                let test = match (equals, matches) {
                    (Some(value), None) => VariableTest::Equals(value.clone()),
                    (None, Some(pattern)) => VariableTest::Matches(compile_regex(pattern)?),
                    (None, None) => VariableTest::Exists,
                    (Some(_), Some(_)) => {
                        return Err(Error::Config(format!(
                            "Variable predicate on '{}' sets both equals and matches",
                            name
                        )));
                    }
                };
                Predicate::Variable {
                    name: name.clone(),
                    test,
                }
            }
            Condition::All(items) => {
                Predicate::All(items.iter().map(Predicate::compile).collect::<Result<Vec<_>>>()?)
            }
            Condition::Any(items) => {
                Predicate::Any(items.iter().map(Predicate::compile).collect::<Result<Vec<_>>>()?)
            }
            Condition::Not(inner) => Predicate::Not(Box::new(Predicate::compile(inner)?)),
        })
    }

    /// Evaluate against a trigger. Referencing an undefined variable in an
    /// `equals` or `matches` test is an error rather than a silent `false`.
    pub fn eval(&self, ctx: &TriggerContext) -> std::result::Result<bool, String> {
        match self {
            Predicate::Event(sources) => Ok(sources.contains(&ctx.source)),
            Predicate::Branch(glob) => Ok(glob.is_match(&ctx.ref_name)),
            Predicate::Schedule(glob) => Ok(ctx.source == EventSource::Schedule
                && ctx
                    .schedule_name
                    .as_deref()
                    .is_some_and(|name| glob.is_match(name))),
            Predicate::MergeRequestTarget(glob) => Ok(ctx
                .merge_request
                .as_ref()
                .is_some_and(|mr| glob.is_match(&mr.target_branch))),
            Predicate::CommitMessage(regex) => Ok(regex.is_match(&ctx.commit_message)),
            Predicate::Variable { name, test } => {
                let value = ctx.variable(name);
                match (test, value) {
                    (VariableTest::Exists, value) => Ok(value.is_some()),
                    (_, None) => Err(format!("variable '{}' is not defined", name)),
                    (VariableTest::Equals(expected), Some(value)) => Ok(&value == expected),
                    (VariableTest::Matches(regex), Some(value)) => Ok(regex.is_match(&value)),
                }
            }
            Predicate::All(items) => {
                for item in items {
                    if !item.eval(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Any(items) => {
                for item in items {
                    if item.eval(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(inner) => inner.eval(ctx).map(|v| !v),
        }
    }
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Config(format!("Invalid regex '{}': {}", pattern, e)))
}

/// A compiled entry of a job's `rules` list.
#[derive(Debug, Clone)]
pub struct Rule {
    pub predicate: Option<Predicate>,
    pub changes: Option<Vec<Glob>>,
    pub when: Option<WhenPolicy>,
    pub variables: IndexMap<String, String>,
    pub allow_failure: Option<bool>,
}

impl Rule {
    pub fn compile(config: &RuleConfig) -> Result<Self> {
        let predicate = config.condition.as_ref().map(Predicate::compile).transpose()?;
        let changes = config
            .changes
            .as_ref()
            .map(|globs| globs.iter().map(|g| Glob::new(g)).collect::<Result<Vec<_>>>())
            .transpose()?;

        Ok(Self {
            predicate,
            changes,
            when: config.when,
            variables: config
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.render()))
                .collect(),
            allow_failure: config.allow_failure,
        })
    }

    /// A rule with neither predicate nor `changes` matches every trigger.
    pub fn is_unconditional(&self) -> bool {
        self.predicate.is_none() && self.changes.is_none()
    }

    fn matches(&self, ctx: &TriggerContext) -> std::result::Result<bool, String> {
        if let Some(predicate) = &self.predicate
            && !predicate.eval(ctx)?
        {
            return Ok(false);
        }
        if let Some(globs) = &self.changes {
            return Ok(ctx
                .changed_files
                .iter()
                .any(|path| globs.iter().any(|g| g.is_match(path))));
        }
        Ok(true)
    }
}

/// Indices of rules that can never be reached because an earlier rule always matches.
pub fn unreachable_rules(rules: &[Rule]) -> Vec<usize> {
    match rules.iter().position(Rule::is_unconditional) {
        Some(first) => (first + 1..rules.len()).collect(),
        None => Vec::new(),
    }
}

/// Result of evaluating a template's rules against a trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Included {
        when: WhenPolicy,
        variables: IndexMap<String, String>,
        allow_failure: bool,
        /// Index of the matching rule; `None` when the template has no rules.
        matched_rule: Option<usize>,
    },
    Excluded {
        reason: ExclusionReason,
    },
}

impl RuleOutcome {
    pub fn is_included(&self) -> bool {
        matches!(self, RuleOutcome::Included { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    NoRuleMatched,
    /// The matching rule says `when: never`.
    WhenNever { rule: usize },
    /// The job itself says `when: never` and has no rules.
    Disabled,
}

/// Evaluates job rules: first match wins, no match excludes.
pub struct RuleEvaluator;

impl RuleEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Decide whether `template` runs for `ctx`.
    pub fn evaluate(&self, template: &JobTemplate, ctx: &TriggerContext) -> RuleOutcome {
        let mut errors = Vec::new();
        self.evaluate_collecting(template, ctx, &mut errors)
    }

    /// Like [`evaluate`](Self::evaluate), also collecting rule evaluation
    /// errors (each treated as a non-match).
    pub fn evaluate_collecting(
        &self,
        template: &JobTemplate,
        ctx: &TriggerContext,
        errors: &mut Vec<Error>,
    ) -> RuleOutcome {
        let Some(rules) = &template.rules else {
            if template.when == WhenPolicy::Never {
                return RuleOutcome::Excluded {
                    reason: ExclusionReason::Disabled,
                };
            }
            return RuleOutcome::Included {
                when: template.when,
                variables: IndexMap::new(),
                allow_failure: template.allow_failure,
                matched_rule: None,
            };
        };

        for (index, rule) in rules.iter().enumerate() {
            let matched = match rule.matches(ctx) {
                Ok(matched) => matched,
                Err(message) => {
                    let err = Error::RuleEvaluation {
                        job: template.name.to_string(),
                        message,
                    };
                    warn!(job = %template.name, rule = index, error = %err, "Rule treated as non-match");
                    errors.push(err);
                    false
                }
            };
            if !matched {
                continue;
            }

            let when = rule.when.unwrap_or(template.when);
            debug!(job = %template.name, rule = index, when = %when, "Rule matched");

            if when == WhenPolicy::Never {
                return RuleOutcome::Excluded {
                    reason: ExclusionReason::WhenNever { rule: index },
                };
            }
            return RuleOutcome::Included {
                when,
                variables: rule.variables.clone(),
                allow_failure: rule.allow_failure.unwrap_or(template.allow_failure),
                matched_rule: Some(index),
            };
        }

        RuleOutcome::Excluded {
            reason: ExclusionReason::NoRuleMatched,
        }
    }
}

impl Default for RuleEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::TemplateCatalog;
    use gantry_core::pipeline::PipelineConfig;
    use gantry_core::trigger::MergeRequestInfo;

    fn catalog(yaml: &str) -> TemplateCatalog {
        TemplateCatalog::load(&PipelineConfig::from_yaml(yaml).unwrap()).unwrap()
    }

    const RULES: &str = r#"
jobs:
  docs:
    script: make docs
    rules:
      - changes: ["docs/**"]
  nightly:
    script: ./nightly.sh
    rules:
      - if: { schedule: nightly }
        when: always
        variables:
          FULL: "1"
  deploy:
    script: ./deploy.sh
    rules:
      - if: { not: { branch: main } }
        when: never
      - if: { variable: { name: DEPLOY, equals: "true" } }
        when: manual
      - if: { event: [push] }
  review:
    script: ./review.sh
    rules:
      - if: { any: [{ merge_request_target: "release/*" }, { commit_message: "\\[review\\]" }] }
  always:
    script: echo hi
"#;

    #[test]
    fn test_no_rules_means_included() {
        let catalog = catalog(RULES);
        let ctx = TriggerContext::new(EventSource::Push, "main");
        let outcome = RuleEvaluator::new().evaluate(catalog.get("always").unwrap(), &ctx);
        assert_eq!(
            outcome,
            RuleOutcome::Included {
                when: WhenPolicy::OnSuccess,
                variables: IndexMap::new(),
                allow_failure: false,
                matched_rule: None,
            }
        );
    }

    #[test]
    fn test_no_match_excludes() {
        let catalog = catalog(RULES);
        let ctx = TriggerContext::new(EventSource::Push, "main").with_changed_files(["src/lib.rs"]);
        let outcome = RuleEvaluator::new().evaluate(catalog.get("docs").unwrap(), &ctx);
        assert_eq!(
            outcome,
            RuleOutcome::Excluded {
                reason: ExclusionReason::NoRuleMatched
            }
        );
    }

    #[test]
    fn test_changes_intersect() {
        let catalog = catalog(RULES);
        let ctx = TriggerContext::new(EventSource::Push, "main")
            .with_changed_files(["docs/guide/intro.md"]);
        assert!(
            RuleEvaluator::new()
                .evaluate(catalog.get("docs").unwrap(), &ctx)
                .is_included()
        );
    }

    #[test]
    fn test_schedule_rule_carries_when_and_variables() {
        let catalog = catalog(RULES);
        let ctx = TriggerContext::new(EventSource::Schedule, "main").with_schedule("nightly");
        match RuleEvaluator::new().evaluate(catalog.get("nightly").unwrap(), &ctx) {
            RuleOutcome::Included {
                when, variables, ..
            } => {
                assert_eq!(when, WhenPolicy::Always);
                assert_eq!(variables["FULL"], "1");
            }
            other => panic!("expected included, got {:?}", other),
        }

        let push = TriggerContext::new(EventSource::Push, "main");
        assert!(
            !RuleEvaluator::new()
                .evaluate(catalog.get("nightly").unwrap(), &push)
                .is_included()
        );
    }

    #[test]
    fn test_first_match_wins_and_never_excludes() {
        let catalog = catalog(RULES);
        let deploy = catalog.get("deploy").unwrap();
        let evaluator = RuleEvaluator::new();

        let feature = TriggerContext::new(EventSource::Push, "feature/x");
        assert_eq!(
            evaluator.evaluate(deploy, &feature),
            RuleOutcome::Excluded {
                reason: ExclusionReason::WhenNever { rule: 0 }
            }
        );

        let manual = TriggerContext::new(EventSource::Push, "main").with_variable("DEPLOY", "true");
        match evaluator.evaluate(deploy, &manual) {
            RuleOutcome::Included {
                when, matched_rule, ..
            } => {
                assert_eq!(when, WhenPolicy::Manual);
                assert_eq!(matched_rule, Some(1));
            }
            other => panic!("expected included, got {:?}", other),
        }
    }

    #[test]
    fn test_undefined_variable_is_contained_non_match() {
        let catalog = catalog(RULES);
        let ctx = TriggerContext::new(EventSource::Push, "main");
        let mut errors = Vec::new();
        let outcome =
            RuleEvaluator::new().evaluate_collecting(catalog.get("deploy").unwrap(), &ctx, &mut errors);

        // Rule 1 errors (DEPLOY undefined); rule 2 still matches the push.
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::RuleEvaluation { .. }));
        match outcome {
            RuleOutcome::Included { when, matched_rule, .. } => {
                assert_eq!(when, WhenPolicy::OnSuccess);
                assert_eq!(matched_rule, Some(2));
            }
            other => panic!("expected included, got {:?}", other),
        }
    }

    #[test]
    fn test_any_combinator() {
        let catalog = catalog(RULES);
        let review = catalog.get("review").unwrap();
        let evaluator = RuleEvaluator::new();

        let mr = TriggerContext::new(EventSource::MergeRequest, "feature/y").with_merge_request(
            MergeRequestInfo {
                title: "Backport".to_string(),
                event_type: None,
                source_branch: "feature/y".to_string(),
                target_branch: "release/2.0".to_string(),
            },
        );
        assert!(evaluator.evaluate(review, &mr).is_included());

        let tagged = TriggerContext::new(EventSource::Push, "main")
            .with_commit_message("wip [review] please");
        assert!(evaluator.evaluate(review, &tagged).is_included());

        let plain = TriggerContext::new(EventSource::Push, "main").with_commit_message("wip");
        assert!(!evaluator.evaluate(review, &plain).is_included());
    }

    #[test]
    fn test_unreachable_rules() {
        let rules = vec![
            Rule::compile(&RuleConfig::default()).unwrap(),
            Rule::compile(&RuleConfig::default()).unwrap(),
            Rule::compile(&RuleConfig::default()).unwrap(),
        ];
        assert_eq!(unreachable_rules(&rules), vec![1, 2]);
        assert!(unreachable_rules(&rules[..1]).is_empty());
    }

    #[test]
    fn test_job_level_never_without_rules() {
        let catalog = catalog("jobs:\n  old:\n    script: ./old.sh\n    when: never\n");
        let push = TriggerContext::new(EventSource::Push, "main");
        assert_eq!(
            RuleEvaluator::new().evaluate(catalog.get("old").unwrap(), &push),
            RuleOutcome::Excluded {
                reason: ExclusionReason::Disabled
            }
        );
    }

    #[test]
    fn test_push_falls_through_to_second_rule() {
        let yaml = r#"
jobs:
  T:
    script: make
    rules:
      - if: { event: [schedule] }
        when: manual
      - if: { event: [push] }
"#;
        let catalog = catalog(yaml);
        let push = TriggerContext::new(EventSource::Push, "main");
        assert_eq!(
            RuleEvaluator::new().evaluate(catalog.get("T").unwrap(), &push),
            RuleOutcome::Included {
                when: WhenPolicy::OnSuccess,
                variables: IndexMap::new(),
                allow_failure: false,
                matched_rule: Some(1),
            }
        );

        let nightly = TriggerContext::new(EventSource::Schedule, "main").with_schedule("nightly");
        match RuleEvaluator::new().evaluate(catalog.get("T").unwrap(), &nightly) {
            RuleOutcome::Included {
                when, matched_rule, ..
            } => {
                assert_eq!(when, WhenPolicy::Manual);
                assert_eq!(matched_rule, Some(0));
            }
            other => panic!("expected inclusion, got {:?}", other),
        }
    }
}
