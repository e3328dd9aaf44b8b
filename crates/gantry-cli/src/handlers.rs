//! Command handlers.

use crate::commands::{RunArgs, SchemaKind, TriggerArgs};
use crate::config::CliConfig;
use anyhow::{Context, Result};
use console::{StyledObject, style};
use gantry_core::events::Event;
use gantry_core::pipeline::PipelineConfig;
use gantry_core::run::JobStatus;
use gantry_core::trigger::TriggerContext;
use gantry_notify::{NotificationPayload, Notifier};
use gantry_runner::{ExecutorConfig, OutputLine, OutputStream, ShellExecutor};
use gantry_scheduler::{
    ExecutionReport, PipelinePlan, Planner, Scheduler, SchedulerHandle, TemplateCatalog,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const STARTER: &str = r#"stages: [build, test, deploy]

variables:
  APP: my-app

jobs:
  .defaults:
    retry: 1
    interruptible: true

  build:
    extends: .defaults
    stage: build
    script: echo "Building $APP"
    artifacts:
      paths: [dist/]

  test:
    extends: .defaults
    stage: test
    parallel:
      matrix:
        - SUITE: [unit, integration]
    script: echo "Testing $SUITE"

  deploy:
    stage: deploy
    script: echo "Deploying $APP"
    rules:
      - if: { branch: main }
        when: manual
"#;

/// Create a starter pipeline file.
pub fn init(path: &Path) -> Result<()> {
    if path.exists() {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(());
    }

    std::fs::write(path, STARTER).with_context(|| format!("writing {}", path.display()))?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(())
}

fn load_catalog(path: &Path) -> Result<TemplateCatalog> {
    let config = PipelineConfig::from_file(path)
        .with_context(|| format!("loading pipeline {}", path.display()))?;
    Ok(TemplateCatalog::load(&config)?)
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("{} {}", style("warning:").yellow().bold(), warning);
    }
}

/// Validate a pipeline configuration.
pub fn validate(path: &Path) -> Result<()> {
    let catalog = load_catalog(path)?;
    let visible = catalog.visible().count();

    println!("{} {} is valid", style("✓").green(), path.display());
    if !catalog.stages().is_empty() {
        println!("  Stages: {}", catalog.stages().join(" → "));
    }
    println!("  Jobs: {}", visible);
    for template in catalog.visible() {
        let stage = template.stage.as_deref().unwrap_or("-");
        println!("    - {} ({})", template.name, style(stage).dim());
    }
    print_warnings(catalog.warnings());
    Ok(())
}

fn build_plan(path: &Path, ctx: &TriggerContext) -> Result<PipelinePlan> {
    let catalog = load_catalog(path)?;
    Ok(Planner::new(&catalog).plan(ctx)?)
}

/// Show what a trigger would run.
pub fn plan(path: &Path, trigger: &TriggerArgs, json: bool) -> Result<()> {
    let ctx = trigger.to_context();
    let plan = build_plan(path, &ctx)?;
    let summary = plan.summary();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "{} {} on {}: {} jobs",
        style("▶").cyan(),
        style(ctx.source).bold(),
        style(&ctx.ref_name).bold(),
        summary.jobs.len()
    );
    for job in &summary.jobs {
        let mut line = format!("  {}", style(&job.key).bold());
        if let Some(stage) = &job.stage {
            line.push_str(&format!(" [{}]", stage));
        }
        if job.when != gantry_core::pipeline::WhenPolicy::OnSuccess {
            line.push_str(&format!(" {}", style(job.when).cyan()));
        }
        if job.allow_failure {
            line.push_str(&format!(" {}", style("allow_failure").dim()));
        }
        println!("{}", line);

        let upstream: Vec<&str> = job
            .needs
            .iter()
            .chain(job.stage_after.iter())
            .map(|k| k.as_str())
            .collect();
        if !upstream.is_empty() {
            println!("      after: {}", style(upstream.join(", ")).dim());
        }
    }
    if !summary.excluded.is_empty() {
        println!("  {} {}", style("excluded:").dim(), summary.excluded.join(", "));
    }
    print_warnings(&summary.warnings);
    Ok(())
}

/// Run a pipeline locally. Returns the process exit code.
pub async fn run(
    config: &CliConfig,
    path: &Path,
    trigger: &TriggerArgs,
    args: &RunArgs,
) -> Result<i32> {
    let ctx = trigger.to_context();
    let plan = build_plan(path, &ctx)?;
    if !args.json {
        print_warnings(&plan.warnings);
    }

    let mut scheduler_config = config.scheduler_config()?;
    if let Some(concurrency) = args.concurrency {
        scheduler_config.concurrency = concurrency.max(1);
    }
    scheduler_config.auto_approve = args.auto_approve;
    scheduler_config.wait_for_approvals = args.wait_for_approvals;
    scheduler_config.pre_approved = args.approve.iter().cloned().collect();

    let workspace = match &args.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let executor = executor(config, workspace, args.json);

    let scheduler = Scheduler::new(executor, scheduler_config);
    let events = scheduler.subscribe();
    let notifier = Arc::new(Notifier::new(if args.no_notify {
        Vec::new()
    } else {
        config.notifications.clone()
    }));

    let pipeline = scheduler.start(plan, &ctx);
    let handle = pipeline.handle();
    debug!(run_id = %pipeline.run_id(), "Pipeline started");

    let printer = tokio::spawn(watch_events(events, notifier.clone(), ctx.clone(), !args.json));
    if args.wait_for_approvals {
        tokio::spawn(read_approvals(handle.clone()));
    }
    let interrupt = tokio::spawn(cancel_on_ctrl_c(handle));

    let report = pipeline.wait().await?;
    interrupt.abort();
    let _ = printer.await;

    if args.json {
        println!("{}", report.to_json()?);
    } else {
        print_report(&report);
    }

    if !notifier.is_empty() {
        for delivery in notifier.notify_report(&report).await {
            if let Err(e) = delivery.result {
                warn!(channel = %delivery.channel, error = %e, "Notification failed");
            }
        }
    }

    Ok(report.exit_code())
}

fn executor(config: &CliConfig, workspace: PathBuf, quiet: bool) -> Arc<ShellExecutor> {
    let executor = ShellExecutor::new(ExecutorConfig {
        workspace,
        shell: config.shell.clone(),
        inherit_env: true,
    });
    if quiet {
        return Arc::new(executor);
    }

    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(print_output(rx));
    Arc::new(executor.with_output(tx))
}

async fn print_output(mut rx: mpsc::Receiver<OutputLine>) {
    while let Some(line) = rx.recv().await {
        let prefix = style(format!("{:>20} │", line.key)).dim();
        match line.stream {
            OutputStream::Stdout => println!("{} {}", prefix, line.content),
            OutputStream::Stderr => eprintln!("{} {}", prefix, style(&line.content).red()),
        }
    }
}

async fn watch_events(
    mut events: broadcast::Receiver<Event>,
    notifier: Arc<Notifier>,
    ctx: TriggerContext,
    verbose: bool,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &event {
            Event::JobStatusChanged(change) if verbose => match change.to {
                JobStatus::Running => {
                    println!("{} {}", style("▶").cyan(), style(&change.key).bold())
                }
                to if to.is_terminal() => {
                    println!("{} {} {}", status_icon(to), style(&change.key).bold(), style(to).dim())
                }
                _ => {}
            },
            Event::JobRetrying(retry) if verbose => println!(
                "{} {} retrying (attempt {}): {}",
                style("↻").yellow(),
                style(&retry.key).bold(),
                retry.next_attempt,
                retry.failure
            ),
            Event::ApprovalRequested(request) => {
                if verbose {
                    println!(
                        "{} {} waiting for approval",
                        style("⏸").cyan(),
                        style(&request.key).bold()
                    );
                }
                if !notifier.is_empty() {
                    let payload = NotificationPayload::approval_requested(
                        request.run_id,
                        request.key.clone(),
                        ctx.ref_name.clone(),
                        ctx.source,
                    );
                    notifier.notify(&payload).await;
                }
            }
            Event::RunCompleted(_) => break,
            _ => {}
        }
    }
}

/// Each stdin line approves the manual job it names.
async fn read_approvals(handle: SchedulerHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let key = line.trim();
        if key.is_empty() {
            continue;
        }
        match handle.approve(key, std::env::var("USER").ok()).await {
            Ok(()) => println!("{} approved {}", style("✓").green(), key),
            Err(gantry_core::Error::SchedulerClosed) => break,
            Err(e) => eprintln!("{} {}", style("error:").red(), e),
        }
    }
}

async fn cancel_on_ctrl_c(handle: SchedulerHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("{} canceling run", style("!").yellow());
        let _ = handle.cancel().await;
    }
}

fn status_icon(status: JobStatus) -> StyledObject<&'static str> {
    match status {
        JobStatus::Succeeded => style("✓").green(),
        JobStatus::Failed => style("✗").red(),
        JobStatus::Canceled => style("⊘").yellow(),
        JobStatus::Skipped => style("-").dim(),
        JobStatus::ManualPending => style("⏸").cyan(),
        _ => style("?").dim(),
    }
}

fn print_report(report: &ExecutionReport) {
    println!();
    for job in &report.jobs {
        let mut line = format!(
            "{} {:<30} {:<10}",
            status_icon(job.status),
            job.key.as_str(),
            job.status
        );
        if let Some(ms) = job.duration_ms {
            line.push_str(&format!(" {:>8.1}s", ms as f64 / 1000.0));
        }
        if job.attempts > 1 {
            line.push_str(&format!(" ({} attempts)", job.attempts));
        }
        if let Some(failure) = &job.failure {
            line.push_str(&format!(" {}", style(failure).red()));
        } else if let Some(reason) = &job.cancel_reason {
            line.push_str(&format!(" {}", style(reason).dim()));
        }
        if job.allow_failure && job.status == JobStatus::Failed {
            line.push_str(&format!(" {}", style("(allowed)").dim()));
        }
        println!("{}", line);
    }

    let counts = report.counts();
    let status = match report.exit_code() {
        0 => style(report.status.to_string()).green().bold(),
        1 => style(report.status.to_string()).red().bold(),
        _ => style(report.status.to_string()).yellow().bold(),
    };
    println!(
        "\nPipeline {} in {:.1}s: {} succeeded, {} failed, {} canceled, {} skipped, {} manual",
        status,
        report.duration_ms as f64 / 1000.0,
        counts.succeeded,
        counts.failed,
        counts.canceled,
        counts.skipped,
        counts.manual
    );
    let reports = report.test_reports();
    if !reports.is_empty() {
        println!("  Reports: {}", reports.join(", "));
    }
    print_warnings(&report.warnings);
}

/// Print a JSON Schema.
pub fn schema(kind: SchemaKind) -> Result<()> {
    let schema = match kind {
        SchemaKind::Pipeline => schemars::schema_for!(PipelineConfig),
        SchemaKind::Trigger => schemars::schema_for!(TriggerContext),
        SchemaKind::Event => schemars::schema_for!(Event),
    };
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Show current configuration.
pub fn show_config(config: &CliConfig) -> Result<()> {
    println!("{}", style("Configuration").bold());
    println!("  Path: {}", CliConfig::config_path()?.display());
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// Set a configuration value.
pub fn set_config(key: &str, value: &str) -> Result<()> {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}
