//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use gantry_core::trigger::{EventSource, MergeRequestInfo, TriggerContext};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Create a starter pipeline file
    Init {
        #[arg(default_value = "gantry.yaml")]
        path: PathBuf,
    },

    /// Validate pipeline configuration
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "gantry.yaml")]
        path: PathBuf,
    },

    /// Show the jobs a trigger would run, in dependency order
    Plan {
        #[arg(default_value = "gantry.yaml")]
        path: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a pipeline locally
    Run {
        #[arg(default_value = "gantry.yaml")]
        path: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Print the JSON Schema of a document type
    Schema {
        #[arg(value_enum, default_value_t = SchemaKind::Pipeline)]
        kind: SchemaKind,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchemaKind {
    Pipeline,
    Trigger,
    Event,
}

/// Describes the event being simulated.
#[derive(Debug, Clone, Args)]
pub struct TriggerArgs {
    /// Trigger source: push, merge_request, schedule, web, trigger, api
    #[arg(long, default_value = "push", env = "GANTRY_SOURCE")]
    pub source: EventSource,

    /// Branch or tag being built
    #[arg(long = "ref", default_value = "main", env = "GANTRY_REF")]
    pub ref_name: String,

    /// Changed file paths (comma-separated or repeated)
    #[arg(long, value_delimiter = ',')]
    pub changed: Vec<String>,

    #[arg(long, default_value = "")]
    pub commit_message: String,

    /// Schedule name for schedule-triggered runs
    #[arg(long)]
    pub schedule: Option<String>,

    /// Merge request target branch; the source branch is --ref
    #[arg(long)]
    pub mr_target: Option<String>,

    #[arg(long, default_value = "")]
    pub mr_title: String,

    /// Extra trigger variable, KEY=VALUE (repeatable)
    #[arg(long = "var", value_parser = parse_key_value)]
    pub variables: Vec<(String, String)>,
}

impl TriggerArgs {
    pub fn to_context(&self) -> TriggerContext {
        let mut ctx = TriggerContext::new(self.source, self.ref_name.clone())
            .with_changed_files(self.changed.iter().cloned())
            .with_commit_message(self.commit_message.clone());
        if let Some(name) = &self.schedule {
            ctx = ctx.with_schedule(name.clone());
        }
        if let Some(target) = &self.mr_target {
            ctx = ctx.with_merge_request(MergeRequestInfo {
                title: self.mr_title.clone(),
                event_type: None,
                source_branch: self.ref_name.clone(),
                target_branch: target.clone(),
            });
        }
        for (key, value) in &self.variables {
            ctx = ctx.with_variable(key.clone(), value.clone());
        }
        ctx
    }
}

/// Execution options for `gantry run`.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Approve a manual job ahead of time (repeatable)
    #[arg(long = "approve")]
    pub approve: Vec<String>,

    /// Approve every manual job
    #[arg(long)]
    pub auto_approve: bool,

    /// Keep running while manual jobs wait, approving them interactively
    #[arg(long)]
    pub wait_for_approvals: bool,

    /// Maximum jobs running at once
    #[arg(short = 'j', long, env = "GANTRY_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Directory scripts run in
    #[arg(long, env = "GANTRY_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Print the execution report as JSON
    #[arg(long)]
    pub json: bool,

    /// Skip configured notifications
    #[arg(long)]
    pub no_notify: bool,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}
