//! Trigger context: the event that started a pipeline run.

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Source of the pipeline trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Push,
    MergeRequest,
    Schedule,
    Web,
    Trigger,
    Api,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Push => "push",
            EventSource::MergeRequest => "merge_request",
            EventSource::Schedule => "schedule",
            EventSource::Web => "web",
            EventSource::Trigger => "trigger",
            EventSource::Api => "api",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "push" => Ok(EventSource::Push),
            "merge_request" => Ok(EventSource::MergeRequest),
            "schedule" => Ok(EventSource::Schedule),
            "web" => Ok(EventSource::Web),
            "trigger" => Ok(EventSource::Trigger),
            "api" => Ok(EventSource::Api),
            other => Err(format!("unknown event source: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MergeRequestInfo {
    pub title: String,
    /// e.g. `opened`, `updated`, `merged_result`.
    #[serde(default)]
    pub event_type: Option<String>,
    pub source_branch: String,
    pub target_branch: String,
}

/// Everything rules and predefined variables may observe about a trigger.
///
/// Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerContext {
    pub source: EventSource,
    pub ref_name: String,
    #[serde(default)]
    pub merge_request: Option<MergeRequestInfo>,
    #[serde(default)]
    pub schedule_name: Option<String>,
    #[serde(default)]
    pub changed_files: BTreeSet<String>,
    #[serde(default)]
    pub commit_message: String,
    /// Pipeline variables supplied by the caller.
    #[serde(default)]
    pub variables: IndexMap<String, String>,
}

impl TriggerContext {
    pub fn new(source: EventSource, ref_name: impl Into<String>) -> Self {
        Self {
            source,
            ref_name: ref_name.into(),
            merge_request: None,
            schedule_name: None,
            changed_files: BTreeSet::new(),
            commit_message: String::new(),
            variables: IndexMap::new(),
        }
    }

    pub fn with_changed_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = message.into();
        self
    }

    pub fn with_schedule(mut self, name: impl Into<String>) -> Self {
        self.schedule_name = Some(name.into());
        self
    }

    pub fn with_merge_request(mut self, mr: MergeRequestInfo) -> Self {
        self.merge_request = Some(mr);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Look up a variable visible to rule predicates: caller-supplied
    /// variables first, then the predefined trigger variables.
    pub fn variable(&self, name: &str) -> Option<String> {
        if let Some(value) = self.variables.get(name) {
            return Some(value.clone());
        }
        self.predefined_variables().shift_remove(name)
    }

    /// Predefined `CI_*` variables derived from the trigger, in a stable order.
    pub fn predefined_variables(&self) -> IndexMap<String, String> {
        let mut vars = IndexMap::new();
        vars.insert(
            "CI_PIPELINE_SOURCE".to_string(),
            self.source.as_str().to_string(),
        );
        vars.insert("CI_COMMIT_REF_NAME".to_string(), self.ref_name.clone());
        if self.merge_request.is_none() {
            vars.insert("CI_COMMIT_BRANCH".to_string(), self.ref_name.clone());
        }
        vars.insert(
            "CI_COMMIT_MESSAGE".to_string(),
            self.commit_message.clone(),
        );
        if let Some(mr) = &self.merge_request {
            vars.insert("CI_MERGE_REQUEST_TITLE".to_string(), mr.title.clone());
            vars.insert(
                "CI_MERGE_REQUEST_SOURCE_BRANCH_NAME".to_string(),
                mr.source_branch.clone(),
            );
            vars.insert(
                "CI_MERGE_REQUEST_TARGET_BRANCH_NAME".to_string(),
                mr.target_branch.clone(),
            );
            if let Some(event_type) = &mr.event_type {
                vars.insert(
                    "CI_MERGE_REQUEST_EVENT_TYPE".to_string(),
                    event_type.clone(),
                );
            }
        }
        if let Some(schedule) = &self.schedule_name {
            vars.insert(
                "CI_PIPELINE_SCHEDULE_NAME".to_string(),
                schedule.clone(),
            );
        }
        vars
    }

    /// Concurrency group shared by runs that supersede each other.
    pub fn concurrency_group(&self) -> &str {
        &self.ref_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_variables_for_push() {
        let ctx = TriggerContext::new(EventSource::Push, "main").with_commit_message("fix: typo");
        let vars = ctx.predefined_variables();
        assert_eq!(vars["CI_PIPELINE_SOURCE"], "push");
        assert_eq!(vars["CI_COMMIT_BRANCH"], "main");
        assert_eq!(vars["CI_COMMIT_MESSAGE"], "fix: typo");
        assert!(!vars.contains_key("CI_MERGE_REQUEST_TITLE"));
    }

    #[test]
    fn test_predefined_variables_for_merge_request() {
        let ctx = TriggerContext::new(EventSource::MergeRequest, "feature/x").with_merge_request(
            MergeRequestInfo {
                title: "Add x".to_string(),
                event_type: None,
                source_branch: "feature/x".to_string(),
                target_branch: "main".to_string(),
            },
        );
        let vars = ctx.predefined_variables();
        assert_eq!(vars["CI_MERGE_REQUEST_TARGET_BRANCH_NAME"], "main");
        assert!(!vars.contains_key("CI_COMMIT_BRANCH"));
    }

    #[test]
    fn test_caller_variables_shadow_predefined() {
        let ctx = TriggerContext::new(EventSource::Web, "main")
            .with_variable("CI_COMMIT_MESSAGE", "override")
            .with_variable("DEPLOY", "1");
        assert_eq!(ctx.variable("DEPLOY").as_deref(), Some("1"));
        assert_eq!(ctx.variable("CI_COMMIT_MESSAGE").as_deref(), Some("override"));
        assert_eq!(ctx.variable("CI_PIPELINE_SOURCE").as_deref(), Some("web"));
        assert_eq!(ctx.variable("MISSING"), None);
    }

    #[test]
    fn test_event_source_parse() {
        assert_eq!("schedule".parse::<EventSource>().unwrap(), EventSource::Schedule);
        assert!("cron".parse::<EventSource>().is_err());
    }
}
