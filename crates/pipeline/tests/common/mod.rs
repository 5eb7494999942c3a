//! Shared fixtures: an in-memory execution backend and a small workflow.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axisweep_comfyui::client::{ExecutionBackend, RemoteOutcome, WaitPolicy};
use axisweep_core::config::Config;
use serde_json::{json, Value};

/// Records every submission and answers from a fixed script.
#[derive(Clone, Default)]
pub struct FakeBackend {
    pub submitted: Arc<Mutex<Vec<Value>>>,
    pub uploads: Arc<Mutex<Vec<PathBuf>>>,
    pub unhealthy: bool,
    /// Every submission fails with this message.
    pub fail_with: Option<String>,
    /// Uploads of files with this name fail.
    pub reject_upload: Option<String>,
}

impl FakeBackend {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> Vec<Value> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

impl ExecutionBackend for FakeBackend {
    async fn health_check(&self) -> bool {
        !self.unhealthy
    }

    async fn execute(&self, workflow: &Value, _policy: WaitPolicy) -> RemoteOutcome {
        let n = {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(workflow.clone());
            submitted.len()
        };
        let prompt_id = format!("prompt-{n}");
        match &self.fail_with {
            Some(message) => {
                RemoteOutcome::failure(message.clone()).with_data(json!({ "prompt_id": prompt_id }))
            }
            None => RemoteOutcome::ok(json!({
                "prompt_id": prompt_id,
                "status": "completed",
                "outputs": { "9": { "images": [{ "filename": format!("img_{n:05}_.png") }] } },
            })),
        }
    }

    async fn upload_input(&self, path: &Path, _subfolder: &str, _overwrite: bool) -> RemoteOutcome {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if self.reject_upload.as_deref() == Some(name.as_str()) {
            return RemoteOutcome::failure("upload rejected");
        }
        self.uploads.lock().unwrap().push(path.to_path_buf());
        RemoteOutcome::ok(json!({ "name": format!("up_{name}"), "subfolder": "", "type": "input" }))
    }
}

/// KSampler on "3", prompts on "6"/"7", save on "9", LoRA on "10",
/// image loader on "11", expression preset on "12".
pub fn workflow_json() -> Value {
    json!({
        "3": {
            "class_type": "KSampler",
            "inputs": {
                "seed": 0, "steps": 20, "cfg": 8.0,
                "sampler_name": "euler", "scheduler": "normal", "denoise": 1.0,
                "model": ["10", 0], "positive": ["6", 0], "negative": ["7", 0],
                "latent_image": ["5", 0]
            }
        },
        "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "", "clip": ["10", 1] } },
        "7": { "class_type": "CLIPTextEncode", "inputs": { "text": "", "clip": ["10", 1] } },
        "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "ComfyUI", "images": ["8", 0] } },
        "10": {
            "class_type": "LoraLoader",
            "inputs": {
                "lora_name": "none.safetensors", "strength_model": 1.0, "strength_clip": 1.0,
                "model": ["4", 0], "clip": ["4", 1]
            }
        },
        "11": { "class_type": "LoadImage", "inputs": { "image": "example.png" } },
        "12": { "class_type": "ExpressionPreset", "inputs": { "expression": "neutral", "image": ["11", 0] } }
    })
}

pub const AXIS_CONFIG: &str = r#"
workflow:
  json_path: workflow.json
  nodes:
    positive_prompt: "6"
    negative_prompt: "7"
    sampler: "3"
    lora: "10"
    save_image: "9"
execution:
  repeats: 1
  randomize_non_target: false
  target_selection: first
  seed_strategy: increment
  seed_base: 100
  poll_interval_secs: 0.01
prompt_template:
  fixed_positive: ["1girl"]
  axes:
    - name: hair
      choices: ["long", "short"]
    - name: color
      choices: ["black", "blonde"]
  negative: ["lowres"]
sampler_choices:
  steps: [28]
  cfg: [6.5]
  sampler_name: ["dpmpp_2m"]
  scheduler: ["karras"]
lora_choices:
  names: ["style.safetensors"]
  model_strength: [0.8]
  clip_strength: [1.0]
"#;

pub const IMAGE_CONFIG: &str = r#"
workflow:
  json_path: workflow.json
  nodes:
    input_image: "11"
    expression: { node_id: "12", input_name: expression }
    save_image: "9"
    seed: "3"
execution:
  repeats: 1
  seed_strategy: fixed
  seed_base: 7
  poll_interval_secs: 0.01
expressions: ["smile", "angry"]
"#;

/// Write the workflow and `config_yaml` into `dir` and load the config.
pub fn setup(dir: &Path, config_yaml: &str) -> Config {
    std::fs::write(dir.join("workflow.json"), workflow_json().to_string()).unwrap();
    let path = dir.join("sweep.yaml");
    std::fs::write(&path, config_yaml).unwrap();
    Config::load(&path).unwrap()
}

/// Every file named `name` under `root`, sorted.
pub fn find_files(root: &Path, name: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().and_then(|n| n.to_str()) == Some(name) {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

pub fn read_json(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}
