mod common;

use assert_matches::assert_matches;
use axisweep_core::exploration::ExplorationState;
use axisweep_pipeline::sweep::AxisSweepRunner;
use axisweep_pipeline::PipelineError;
use common::{find_files, read_json, setup, FakeBackend, AXIS_CONFIG};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn sweeps_target_axis_with_pinned_non_target() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), AXIS_CONFIG);
    let backend = FakeBackend::healthy();
    let mut runner = AxisSweepRunner::new(config, backend.clone(), false).unwrap();

    runner.preflight().await.unwrap();
    let plan = runner.plan().unwrap().unwrap();
    assert_eq!(plan.target_axis, "hair");
    assert_eq!(plan.combinations, 2);
    assert_eq!(plan.total_runs(), 2);

    let summary = runner.execute(&plan, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert!(!summary.interrupted);

    let submitted = backend.submissions();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0]["6"]["inputs"]["text"], "1girl, long, black");
    assert_eq!(submitted[1]["6"]["inputs"]["text"], "1girl, short, black");
    assert_eq!(submitted[0]["7"]["inputs"]["text"], "lowres");
    assert_eq!(submitted[0]["3"]["inputs"]["steps"], 28);
    assert_eq!(submitted[0]["3"]["inputs"]["sampler_name"], "dpmpp_2m");
    assert_eq!(submitted[0]["10"]["inputs"]["lora_name"], "style.safetensors");
    assert_eq!(submitted[0]["10"]["inputs"]["strength_model"], 0.8);
    // Linked inputs are never touched.
    assert_eq!(submitted[0]["3"]["inputs"]["model"], serde_json::json!(["10", 0]));

    let state = ExplorationState::load(dir.path().join("axis_state.json"));
    assert!(state.is_used("hair"));
    assert_eq!(state.remaining(&["hair", "color"]), vec!["color".to_string()]);
}

#[tokio::test]
async fn writes_params_file_per_combination() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), AXIS_CONFIG);
    let mut runner = AxisSweepRunner::new(config, FakeBackend::healthy(), false).unwrap();
    let plan = runner.plan_for("color").unwrap();
    runner.execute(&plan, &CancellationToken::new()).await.unwrap();

    let files = find_files(&dir.path().join("output"), "params.json");
    assert_eq!(files.len(), 2);
    let first = read_json(&files[0]);
    assert_eq!(first["index"], 1);
    assert_eq!(first["target_axis"], "color");
    assert_eq!(first["axis_values"]["hair"], "long");
    assert_eq!(first["axis_values"]["color"], "black");
    let attempt = &first["attempts"][0];
    assert_eq!(attempt["success"], true);
    assert_eq!(attempt["prompt_id"], "prompt-1");
    assert_eq!(attempt["workflow_fingerprint"].as_str().unwrap().len(), 64);
    let run_id = first["run_id"].as_str().unwrap();
    assert_eq!(attempt["filename_prefix"], format!("{run_id}/img"));
}

#[tokio::test]
async fn increment_seeds_follow_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = AXIS_CONFIG
        .replace("repeats: 1", "repeats: 3")
        .replace("choices: [\"long\", \"short\"]", "choices: [\"long\"]");
    let config = setup(dir.path(), &yaml);
    let backend = FakeBackend::healthy();
    let mut runner = AxisSweepRunner::new(config, backend.clone(), false).unwrap();

    let plan = runner.plan_for("hair").unwrap();
    assert_eq!(plan.total_runs(), 3);
    runner.execute(&plan, &CancellationToken::new()).await.unwrap();

    let seeds: Vec<i64> = backend
        .submissions()
        .iter()
        .map(|w| w["3"]["inputs"]["seed"].as_i64().unwrap())
        .collect();
    assert_eq!(seeds, vec![100, 101, 102]);

    let record = read_json(&find_files(&dir.path().join("output"), "params.json")[0]);
    let recorded: Vec<i64> = record["attempts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["seed"].as_i64().unwrap())
        .collect();
    assert_eq!(recorded, vec![100, 101, 102]);
}

#[tokio::test]
async fn failures_are_recorded_and_do_not_stop_the_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), AXIS_CONFIG);
    let backend = FakeBackend {
        fail_with: Some("node 3 (KSampler) raised RuntimeError: out of memory".into()),
        ..FakeBackend::default()
    };
    let mut runner = AxisSweepRunner::new(config, backend.clone(), false).unwrap();
    let plan = runner.plan().unwrap().unwrap();

    let summary = runner.execute(&plan, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(backend.submissions().len(), 2);

    for file in find_files(&dir.path().join("output"), "params.json") {
        let attempt = &read_json(&file)["attempts"][0];
        assert_eq!(attempt["success"], false);
        assert!(attempt["error"].as_str().unwrap().contains("out of memory"));
    }
}

#[tokio::test]
async fn dry_run_submits_nothing_and_keeps_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), AXIS_CONFIG);
    let backend = FakeBackend {
        unhealthy: true,
        ..FakeBackend::default()
    };
    let mut runner = AxisSweepRunner::new(config, backend.clone(), true).unwrap();

    runner.preflight().await.unwrap();
    let plan = runner.plan().unwrap().unwrap();
    let summary = runner.execute(&plan, &CancellationToken::new()).await.unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.submitted(), 0);
    assert!(backend.submissions().is_empty());
    assert!(!runner.state().is_used("hair"));

    let files = find_files(&dir.path().join("output"), "params.json");
    assert_eq!(files.len(), 2);
    let record = read_json(&files[0]);
    assert_eq!(record["dry_run"], true);
    assert_eq!(record["attempts"][0]["seed"], 100);
}

#[tokio::test]
async fn unreachable_server_aborts_before_submitting() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), AXIS_CONFIG);
    let backend = FakeBackend {
        unhealthy: true,
        ..FakeBackend::default()
    };
    let runner = AxisSweepRunner::new(config, backend.clone(), false).unwrap();

    let err = runner.preflight().await.unwrap_err();
    assert!(err.is_unreachable());
    assert!(backend.submissions().is_empty());
}

#[tokio::test]
async fn missing_required_node_fails_preflight() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = AXIS_CONFIG.replace("sampler: \"3\"", "sampler: \"99\"");
    let config = setup(dir.path(), &yaml);
    let runner = AxisSweepRunner::new(config, FakeBackend::healthy(), false).unwrap();

    let err = runner.preflight().await.unwrap_err();
    assert_matches!(err, PipelineError::InvalidWorkflow(_));
    assert!(err.is_config());
}

#[tokio::test]
async fn unknown_target_axis_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), AXIS_CONFIG);
    let runner = AxisSweepRunner::new(config, FakeBackend::healthy(), false).unwrap();
    let err = runner.plan_for("pose").unwrap_err();
    assert!(err.is_config());
}

#[tokio::test]
async fn nothing_to_do_once_every_axis_is_used() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), AXIS_CONFIG);
    let mut runner = AxisSweepRunner::new(config, FakeBackend::healthy(), false).unwrap();

    runner.state_mut().mark_used("hair").unwrap();
    runner.state_mut().mark_used("color").unwrap();
    assert!(runner.plan().unwrap().is_none());
    assert_eq!(runner.progress().percentage, 100.0);

    runner.state_mut().remove("color").unwrap();
    assert_eq!(runner.plan().unwrap().unwrap().target_axis, "color");
}

#[tokio::test]
async fn cancelled_sweep_does_not_mark_axis() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), AXIS_CONFIG);
    let backend = FakeBackend::healthy();
    let mut runner = AxisSweepRunner::new(config, backend.clone(), false).unwrap();
    let plan = runner.plan().unwrap().unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = runner.execute(&plan, &cancel).await.unwrap();

    assert!(summary.interrupted);
    assert!(backend.submissions().is_empty());
    assert!(!runner.state().is_used("hair"));
}
