//! Serialization tests for gantry-core types.

use chrono::Utc;
use gantry_core::events::*;
use gantry_core::ids::*;
use gantry_core::pipeline::*;
use gantry_core::ports::*;
use gantry_core::run::*;
use gantry_core::trigger::*;

#[test]
fn test_event_is_tagged_by_type() {
    let event = Event::JobStatusChanged(JobStatusChangedPayload {
        run_id: RunId::new(),
        key: InstanceKey::new("test[OS=linux]"),
        from: JobStatus::Running,
        to: JobStatus::Failed,
        failure: Some(FailureReason::ExitCode { code: 2 }),
        cancel_reason: None,
        at: Utc::now(),
    });

    let json = serde_json::to_value(&event).expect("serialize");
    assert_eq!(json["type"], "job_status_changed");
    assert_eq!(json["to"], "failed");
    assert_eq!(json["failure"]["kind"], "exit_code");
    assert!(json.get("cancel_reason").is_none());

    let parsed: Event = serde_json::from_value(json).expect("deserialize");
    assert_eq!(parsed.run_id(), event.run_id());
    assert_eq!(parsed.name(), "job.status_changed");
}

#[test]
fn test_run_completed_payload_roundtrip() {
    let payload = RunCompletedPayload {
        run_id: RunId::new(),
        status: PipelineStatus::Canceled,
        completed_at: Utc::now(),
        duration_ms: 12345,
    };

    let json = serde_json::to_string(&payload).expect("serialize");
    let parsed: RunCompletedPayload = serde_json::from_str(&json).expect("deserialize");

    assert_eq!(payload.status, parsed.status);
    assert_eq!(payload.duration_ms, parsed.duration_ms);
}

#[test]
fn test_trigger_context_from_json() {
    let json = r#"{
        "source": "merge_request",
        "ref_name": "feature/login",
        "merge_request": {
            "title": "Add login",
            "source_branch": "feature/login",
            "target_branch": "main"
        },
        "changed_files": ["src/login.rs", "README.md"],
        "variables": { "DEPLOY": "false" }
    }"#;

    let ctx: TriggerContext = serde_json::from_str(json).expect("deserialize");
    assert_eq!(ctx.source, EventSource::MergeRequest);
    assert_eq!(ctx.changed_files.len(), 2);
    assert_eq!(ctx.commit_message, "");
    assert_eq!(
        ctx.merge_request.as_ref().map(|mr| mr.target_branch.as_str()),
        Some("main")
    );
}

#[test]
fn test_job_request_roundtrip() {
    let request = JobRequest {
        run_id: RunId::new(),
        key: InstanceKey::new("build"),
        job_name: "build".to_string(),
        stage: Some("build".to_string()),
        attempt: 1,
        variables: [("CI_JOB_NAME".to_string(), "build".to_string())]
            .into_iter()
            .collect(),
        before_script: vec![],
        script: vec!["make".to_string()],
        after_script: vec![],
        artifacts: ArtifactConfig {
            paths: vec!["target/app".to_string()],
            ..ArtifactConfig::default()
        },
        upstream_artifacts: vec![],
        timeout: Some(std::time::Duration::from_secs(60)),
    };

    let json = serde_json::to_string(&request).expect("serialize");
    let parsed: JobRequest = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(parsed.key, request.key);
    assert_eq!(parsed.timeout, request.timeout);
    assert_eq!(parsed.artifacts, request.artifacts);
}

#[test]
fn test_pipeline_config_schema_generates() {
    let schema = schemars::schema_for!(PipelineConfig);
    let json = serde_json::to_value(&schema).expect("serialize schema");
    assert!(json["properties"]["jobs"].is_object());
}
