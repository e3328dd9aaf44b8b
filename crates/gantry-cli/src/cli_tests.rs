//! Argument parsing and end-to-end local runs.

use crate::Cli;
use crate::commands::{Commands, RunArgs, TriggerArgs};
use crate::config::CliConfig;
use crate::handlers;
use clap::Parser;
use gantry_core::pipeline::{PipelineConfig, WhenPolicy};
use gantry_core::trigger::EventSource;
use gantry_scheduler::{Planner, TemplateCatalog};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use tempfile::TempDir;

fn parse_run(args: &[&str]) -> (PathBuf, TriggerArgs, RunArgs) {
    let argv = std::iter::once("gantry").chain(args.iter().copied());
    match Cli::try_parse_from(argv).unwrap().command {
        Commands::Run { path, trigger, run } => (path, trigger, run),
        _ => panic!("expected run command"),
    }
}

#[test]
fn test_trigger_flags_build_context() {
    let (path, trigger, run) = parse_run(&[
        "run",
        "ci.yaml",
        "--source",
        "merge_request",
        "--ref",
        "feature/login",
        "--mr-target",
        "main",
        "--changed",
        "src/a.rs,docs/b.md",
        "--var",
        "DEPLOY=1",
        "--approve",
        "deploy",
        "-j",
        "2",
    ]);
    assert_eq!(path, PathBuf::from("ci.yaml"));
    assert_eq!(run.approve, vec!["deploy"]);
    assert_eq!(run.concurrency, Some(2));

    let ctx = trigger.to_context();
    assert_eq!(ctx.source, EventSource::MergeRequest);
    assert_eq!(ctx.ref_name, "feature/login");
    assert_eq!(ctx.changed_files.len(), 2);
    assert_eq!(
        ctx.merge_request.as_ref().map(|mr| mr.target_branch.as_str()),
        Some("main")
    );
    assert_eq!(ctx.variable("DEPLOY").as_deref(), Some("1"));
}

#[test]
fn test_bad_variable_flag_is_rejected() {
    let result = Cli::try_parse_from(["gantry", "run", "--var", "NOVALUE"]);
    assert!(result.is_err());
}

#[test]
fn test_config_set_validates() {
    let mut config = CliConfig::default();
    config.set("concurrency", "8").unwrap();
    config.set("grace_period", "30s").unwrap();
    assert_eq!(config.concurrency, 8);
    assert!(config.set("concurrency", "0").is_err());
    assert!(config.set("grace_period", "soon").is_err());
    assert!(config.set("colour", "blue").is_err());

    let scheduler = config.scheduler_config().unwrap();
    assert_eq!(scheduler.grace_period.as_secs(), 30);
}

const PIPELINE: &str = r#"
stages: [build, test]
jobs:
  build:
    stage: build
    script: mkdir -p dist && echo built > dist/app
    artifacts:
      paths: [dist/app]
  test:
    stage: test
    script: test -f dist/app && echo "$SUITE" >> suites.txt
    parallel:
      matrix:
        - SUITE: [unit, e2e]
"#;

async fn run_in(dir: &TempDir, pipeline: &str, extra: &[&str]) -> i32 {
    let path = dir.path().join("gantry.yaml");
    std::fs::write(&path, pipeline).unwrap();

    let workspace = dir.path().to_string_lossy().to_string();
    let path_arg = path.to_string_lossy().to_string();
    let mut args = vec![
        "run",
        path_arg.as_str(),
        "--workspace",
        workspace.as_str(),
        "--json",
        "--no-notify",
    ];
    args.extend_from_slice(extra);
    let (path, trigger, run) = parse_run(&args);

    handlers::run(&CliConfig::default(), &path, &trigger, &run)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_local_run_succeeds() {
    let dir = TempDir::new().unwrap();
    let code = run_in(&dir, PIPELINE, &[]).await;

    assert_eq!(code, 0);
    let suites = std::fs::read_to_string(dir.path().join("suites.txt")).unwrap();
    let mut lines: Vec<&str> = suites.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["e2e", "unit"]);
}

#[tokio::test]
async fn test_local_run_failure_exit_code() {
    let dir = TempDir::new().unwrap();
    let failing = PIPELINE.replace("mkdir -p dist && echo built > dist/app", "exit 4");
    let code = run_in(&dir, &failing, &[]).await;

    assert_eq!(code, 1);
    assert!(!dir.path().join("suites.txt").exists());
}

#[tokio::test]
async fn test_invalid_pipeline_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gantry.yaml");
    std::fs::write(&path, "jobs:\n  a:\n    script: x\n    needs: [missing]\n").unwrap();
    let path_arg = path.to_string_lossy().to_string();
    let (path, trigger, run) = parse_run(&["run", path_arg.as_str(), "--json", "--no-notify"]);

    let result = handlers::run(&CliConfig::default(), &path, &trigger, &run).await;
    assert!(result.is_err());
}

#[test]
fn test_starter_pipeline_loads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gantry.yaml");
    handlers::init(&path).unwrap();
    handlers::validate(&path).unwrap();

    let (_, trigger, _) = parse_run(&["run", "--ref", "main"]);
    handlers::plan(&path, &trigger, true).unwrap();

    let config = PipelineConfig::from_file(&path).unwrap();
    let catalog = TemplateCatalog::load(&config).unwrap();
    let plan = Planner::new(&catalog).plan(&trigger.to_context()).unwrap();
    let deploy = plan.summary().jobs.into_iter().find(|j| j.key.as_str() == "deploy");
    assert_eq!(deploy.map(|j| j.when), Some(WhenPolicy::Manual));
}
