mod common;

use std::path::Path;

use axisweep_pipeline::image_batch::{ImageBatchOptions, ImageBatchRunner};
use common::{find_files, read_json, setup, FakeBackend, IMAGE_CONFIG};
use tokio_util::sync::CancellationToken;

fn images_dir(root: &Path, names: &[&str]) -> std::path::PathBuf {
    let dir = root.join("faces");
    std::fs::create_dir_all(&dir).unwrap();
    for name in names {
        std::fs::write(dir.join(name), b"png").unwrap();
    }
    dir
}

fn options(images_dir: std::path::PathBuf, dry_run: bool) -> ImageBatchOptions {
    ImageBatchOptions {
        images_dir,
        recursive: false,
        limit: None,
        dry_run,
    }
}

#[tokio::test]
async fn runs_every_expression_for_every_image() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), IMAGE_CONFIG);
    let images = images_dir(dir.path(), &["alice.png", "bob.jpg"]);
    let backend = FakeBackend::healthy();
    let runner = ImageBatchRunner::new(config, backend.clone(), options(images, false)).unwrap();

    runner.preflight().await.unwrap();
    let plan = runner.plan().unwrap();
    assert_eq!(plan.images.len(), 2);
    assert_eq!(plan.total_runs(), 4);

    let summary = runner.execute(&plan, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.succeeded, 4);
    assert_eq!(backend.upload_count(), 2);

    let submitted = backend.submissions();
    assert_eq!(submitted.len(), 4);
    assert_eq!(submitted[0]["11"]["inputs"]["image"], "up_alice.png");
    assert_eq!(submitted[0]["12"]["inputs"]["expression"], "smile");
    assert_eq!(submitted[1]["12"]["inputs"]["expression"], "angry");
    assert_eq!(submitted[2]["11"]["inputs"]["image"], "up_bob.jpg");
    // Fixed seed strategy goes to the dedicated seed node.
    assert!(submitted.iter().all(|w| w["3"]["inputs"]["seed"] == 7));
    // The link into the expression node stays wired.
    assert_eq!(submitted[0]["12"]["inputs"]["image"], serde_json::json!(["11", 0]));

    let prefix = submitted[0]["9"]["inputs"]["filename_prefix"].as_str().unwrap();
    assert!(prefix.starts_with("alice/smile/"), "prefix was {prefix}");
    assert!(prefix.ends_with("/img"));

    let metas = find_files(&dir.path().join("output"), "meta.json");
    assert_eq!(metas.len(), 4);
    let meta = read_json(&find_files(&dir.path().join("output/alice/smile"), "meta.json")[0]);
    assert_eq!(meta["tool"], "image_batch");
    assert_eq!(meta["success"], true);
    assert_eq!(meta["seed"], 7);
    assert_eq!(meta["input"]["uploaded_name"], "up_alice.png");
    assert!(meta["history"]["9"]["images"].is_array());
}

#[tokio::test]
async fn failed_upload_skips_the_image() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), IMAGE_CONFIG);
    let images = images_dir(dir.path(), &["alice.png", "bob.png"]);
    let backend = FakeBackend {
        reject_upload: Some("alice.png".into()),
        ..FakeBackend::default()
    };
    let runner = ImageBatchRunner::new(config, backend.clone(), options(images, false)).unwrap();

    let plan = runner.plan().unwrap();
    let summary = runner.execute(&plan, &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.succeeded, 2);
    assert!(backend
        .submissions()
        .iter()
        .all(|w| w["11"]["inputs"]["image"] == "up_bob.png"));
}

#[tokio::test]
async fn sampler_sweep_multiplies_runs() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = IMAGE_CONFIG.replace("    seed: \"3\"\n", "    seed: \"3\"\n    sampler: \"3\"\n")
        + "sampler_choices:\n  steps: [20, 30]\n  cfg: [5.0]\n  sampler_name: [euler]\n  scheduler: [normal]\n  denoise: [0.4]\n";
    let config = setup(dir.path(), &yaml);
    let images = images_dir(dir.path(), &["alice.png"]);
    let backend = FakeBackend::healthy();
    let runner = ImageBatchRunner::new(config, backend.clone(), options(images, false)).unwrap();

    let plan = runner.plan().unwrap();
    assert_eq!(plan.sampler_combinations, 2);
    assert_eq!(plan.total_runs(), 4);
    runner.execute(&plan, &CancellationToken::new()).await.unwrap();

    let steps: Vec<i64> = backend
        .submissions()
        .iter()
        .map(|w| w["3"]["inputs"]["steps"].as_i64().unwrap())
        .collect();
    assert_eq!(steps, vec![20, 30, 20, 30]);
    assert_eq!(backend.submissions()[0]["3"]["inputs"]["denoise"], 0.4);
}

#[tokio::test]
async fn dry_run_writes_metadata_only() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), IMAGE_CONFIG);
    let images = images_dir(dir.path(), &["alice.png"]);
    let backend = FakeBackend {
        unhealthy: true,
        ..FakeBackend::default()
    };
    let runner = ImageBatchRunner::new(config, backend.clone(), options(images, true)).unwrap();

    runner.preflight().await.unwrap();
    let plan = runner.plan().unwrap();
    let summary = runner.execute(&plan, &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.submitted(), 0);
    assert_eq!(backend.upload_count(), 0);
    assert!(backend.submissions().is_empty());

    let metas = find_files(&dir.path().join("output"), "meta.json");
    assert_eq!(metas.len(), 2);
    let meta = read_json(&metas[0]);
    assert_eq!(meta["dry_run"], true);
    assert_eq!(meta["input"]["uploaded_name"], "alice.png");
    assert!(meta.get("success").is_none());
}

#[tokio::test]
async fn axis_only_config_is_rejected_for_image_batches() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), common::AXIS_CONFIG);
    let images = images_dir(dir.path(), &["alice.png"]);
    let err = ImageBatchRunner::new(config, FakeBackend::healthy(), options(images, false))
        .err()
        .unwrap();
    assert!(err.is_config());
}

#[tokio::test]
async fn sampler_placeholders_without_sampler_node_fail_before_upload() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = IMAGE_CONFIG.replace(
        "  json_path: workflow.json\n",
        "  json_path: workflow.json\n  filename_prefix_template: \"{image}/s{steps}/{run}\"\n",
    ) + "sampler_choices:\n  steps: [20]\n  cfg: [5.0]\n  sampler_name: [euler]\n  scheduler: [normal]\n";
    let config = setup(dir.path(), &yaml);
    let images = images_dir(dir.path(), &["alice.png"]);
    let backend = FakeBackend::healthy();

    let err = ImageBatchRunner::new(config, backend.clone(), options(images, false))
        .err()
        .unwrap();
    assert!(err.is_config());
    assert_eq!(backend.upload_count(), 0);
    assert!(backend.submissions().is_empty());
}
