//! Typed workflow graphs and parameter injection.
//!
//! A workflow is a JSON object keyed by node id:
//!
//! ```json
//! {
//!   "3": {
//!     "class_type": "KSampler",
//!     "inputs": { "seed": 42, "cfg": 7.5, "model": ["4", 0] }
//!   }
//! }
//! ```
//!
//! Inputs holding `[producer_node_id, output_index]` are links to another
//! node's output. They parse into [`InputValue::Link`] and the injector
//! never overwrites them. Everything the typed model does not interpret
//! (`_meta`, unknown node keys, malformed `inputs`) is carried through
//! untouched so a loaded graph serializes back to the same JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::combination::{LoraParams, SamplerParams};
use crate::error::{CoreError, FieldError};
use crate::hashing::workflow_fingerprint;
use crate::types::{NodeId, Seed};

// ---------------------------------------------------------------------------
// Graph model
// ---------------------------------------------------------------------------

/// Reference to output `output_index` of node `node_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLink {
    pub node_id: NodeId,
    pub output_index: u64,
}

/// One value in a node's `inputs` mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// A literal value the injector may overwrite.
    Scalar(Value),
    /// Wired to another node's output. Never overwritten.
    Link(NodeLink),
    /// Any other array. Treated like a link: never overwritten.
    Sequence(Vec<Value>),
}

impl InputValue {
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Value> for InputValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => match parse_link(&items) {
                Some(link) => Self::Link(link),
                None => Self::Sequence(items),
            },
            other => Self::Scalar(other),
        }
    }
}

/// `["<node id>", <output index>]`; anything else is not a link.
fn parse_link(items: &[Value]) -> Option<NodeLink> {
    match items {
        [Value::String(node_id), Value::Number(idx)] => Some(NodeLink {
            node_id: node_id.clone(),
            output_index: idx.as_u64()?,
        }),
        _ => None,
    }
}

impl From<InputValue> for Value {
    fn from(input: InputValue) -> Self {
        match input {
            InputValue::Scalar(v) => v,
            InputValue::Link(link) => Value::Array(vec![
                Value::String(link.node_id),
                Value::from(link.output_index),
            ]),
            InputValue::Sequence(items) => Value::Array(items),
        }
    }
}

impl Serialize for InputValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Value::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InputValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from)
    }
}

/// A node's `inputs` field.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum NodeInputs {
    /// No `inputs` key at all.
    #[default]
    Absent,
    Map(BTreeMap<String, InputValue>),
    /// Present but not an object; kept verbatim and never written to.
    Malformed(Value),
}

impl NodeInputs {
    fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, InputValue>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl Serialize for NodeInputs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Absent => serializer.serialize_none(),
            Self::Map(map) => map.serialize(serializer),
            Self::Malformed(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for NodeInputs {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, InputValue::from(v)))
                    .collect(),
            ),
            other => Self::Malformed(other),
        })
    }
}

/// One node of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_type: Option<String>,
    #[serde(default, skip_serializing_if = "NodeInputs::is_absent")]
    pub inputs: NodeInputs,
    /// Keys the typed model does not interpret (`_meta`, `type`, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl WorkflowNode {
    /// Node kind tag: `class_type`, falling back to a plain `type` key.
    pub fn kind(&self) -> Option<&str> {
        self.class_type
            .as_deref()
            .or_else(|| self.extra.get("type").and_then(Value::as_str))
    }
}

/// A full workflow graph, keyed by node id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph {
    pub nodes: BTreeMap<NodeId, WorkflowNode>,
}

impl WorkflowGraph {
    /// Parse a graph from JSON. The top level must be a non-empty object of
    /// node objects.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let obj = value
            .as_object()
            .ok_or_else(|| CoreError::Workflow("Workflow JSON must be an object".to_string()))?;

        if obj.is_empty() {
            return Err(CoreError::Workflow(
                "Workflow JSON must contain at least one node".to_string(),
            ));
        }
        if let Some((node_id, _)) = obj.iter().find(|(_, node)| !node.is_object()) {
            return Err(CoreError::Workflow(format!(
                "Node '{node_id}' must be an object"
            )));
        }

        serde_json::from_value(value)
            .map_err(|e| CoreError::Workflow(format!("Invalid workflow graph: {e}")))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// SHA-256 of the compact JSON form.
    pub fn fingerprint(&self) -> String {
        workflow_fingerprint(&self.to_value())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(node_id)
    }

    pub fn input(&self, node_id: &str, input_name: &str) -> Option<&InputValue> {
        self.node(node_id)?.inputs.as_map()?.get(input_name)
    }

    /// Overwrite scalar inputs according to `bindings`.
    ///
    /// Each binding is independent: a missing node, malformed `inputs` or a
    /// linked input skips that binding only, with a warning. Inputs absent
    /// from an otherwise valid `inputs` mapping are added.
    pub fn apply(&mut self, bindings: &[Binding]) -> ApplyReport {
        let mut report = ApplyReport::default();

        for binding in bindings {
            match self.apply_one(binding) {
                Ok(()) => {
                    tracing::debug!(
                        node_id = %binding.node_id,
                        input = %binding.input_name,
                        value = %binding.value,
                        "Applied binding"
                    );
                    report.applied += 1;
                }
                Err(reason) => {
                    tracing::warn!(
                        node_id = %binding.node_id,
                        input = %binding.input_name,
                        reason = %reason,
                        "Skipped binding"
                    );
                    report.skipped.push(SkippedBinding {
                        node_id: binding.node_id.clone(),
                        input_name: binding.input_name.clone(),
                        reason,
                    });
                }
            }
        }

        report
    }

    fn apply_one(&mut self, binding: &Binding) -> Result<(), SkipReason> {
        let node = self
            .nodes
            .get_mut(&binding.node_id)
            .ok_or(SkipReason::MissingNode)?;

        let NodeInputs::Map(inputs) = &mut node.inputs else {
            return Err(SkipReason::InputsNotMapping);
        };

        match inputs.get_mut(&binding.input_name) {
            Some(InputValue::Scalar(current)) => {
                *current = binding.value.to_json();
                Ok(())
            }
            Some(InputValue::Link(_)) => Err(SkipReason::LinkedInput),
            Some(InputValue::Sequence(_)) => Err(SkipReason::SequenceInput),
            None => {
                inputs.insert(
                    binding.input_name.clone(),
                    InputValue::Scalar(binding.value.to_json()),
                );
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// A value coerced to the type the target input expects.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ScalarValue {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for ScalarValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Write `value` into `inputs[input_name]` of node `node_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub node_id: NodeId,
    pub input_name: String,
    pub value: ScalarValue,
}

impl Binding {
    pub fn new(
        node_id: impl Into<NodeId>,
        input_name: impl Into<String>,
        value: impl Into<ScalarValue>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            input_name: input_name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingNode,
    InputsNotMapping,
    LinkedInput,
    SequenceInput,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MissingNode => "node not found in workflow",
            Self::InputsNotMapping => "node inputs are not a mapping",
            Self::LinkedInput => "input is linked to another node",
            Self::SequenceInput => "input holds a list value",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedBinding {
    pub node_id: NodeId,
    pub input_name: String,
    pub reason: SkipReason,
}

/// Outcome of [`WorkflowGraph::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: Vec<SkippedBinding>,
}

// ---------------------------------------------------------------------------
// Node mapping
// ---------------------------------------------------------------------------

/// Which sweep is being run; decides which nodes are mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Prompt-axis sweep (prompts, sampler, LoRA).
    Axis,
    /// Expression batch over a directory of input images.
    ImageBatch,
}

/// A node id with an optional input-name override. Accepts either a bare
/// id string or `{node_id, input_name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "NodeRefRepr")]
pub struct NodeRef {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_name: Option<String>,
}

impl NodeRef {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            input_name: None,
        }
    }

    pub fn input_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.input_name.as_deref().unwrap_or(default)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NodeRefRepr {
    Id(NodeId),
    Full {
        node_id: NodeId,
        #[serde(default)]
        input_name: Option<String>,
    },
}

impl From<NodeRefRepr> for NodeRef {
    fn from(repr: NodeRefRepr) -> Self {
        match repr {
            NodeRefRepr::Id(node_id) => Self::new(node_id),
            NodeRefRepr::Full {
                node_id,
                input_name,
            } => Self {
                node_id,
                input_name,
            },
        }
    }
}

/// Input names on the sampler node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerInputs {
    pub steps: String,
    pub cfg: String,
    pub sampler_name: String,
    pub scheduler: String,
    pub seed: String,
    pub denoise: String,
}

impl Default for SamplerInputs {
    fn default() -> Self {
        Self {
            steps: "steps".into(),
            cfg: "cfg".into(),
            sampler_name: "sampler_name".into(),
            scheduler: "scheduler".into(),
            seed: "seed".into(),
            denoise: "denoise".into(),
        }
    }
}

/// Input names on the LoRA loader node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraInputs {
    pub name: String,
    pub model_strength: String,
    pub clip_strength: String,
}

impl Default for LoraInputs {
    fn default() -> Self {
        Self {
            name: "lora_name".into(),
            model_strength: "strength_model".into(),
            clip_strength: "strength_clip".into(),
        }
    }
}

/// Where each injected parameter goes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMapping {
    pub positive_prompt: Option<NodeRef>,
    pub negative_prompt: Option<NodeRef>,
    pub sampler: Option<NodeId>,
    pub lora: Option<NodeId>,
    pub save_image: Option<NodeRef>,
    pub seed: Option<NodeRef>,
    pub input_image: Option<NodeRef>,
    pub expression: Option<NodeRef>,
    pub sampler_inputs: SamplerInputs,
    pub lora_inputs: LoraInputs,
    /// Extra node ids that must exist in the workflow.
    pub required: Vec<NodeId>,
}

impl NodeMapping {
    /// Report mapping entries a given mode cannot run without.
    pub fn check_for(&self, mode: SweepMode, errors: &mut Vec<FieldError>) {
        let needed: Vec<(&str, bool)> = match mode {
            SweepMode::Axis => vec![
                ("positive_prompt", self.positive_prompt.is_some()),
                ("negative_prompt", self.negative_prompt.is_some()),
                ("sampler", self.sampler.is_some()),
                ("lora", self.lora.is_some()),
            ],
            SweepMode::ImageBatch => vec![
                ("input_image", self.input_image.is_some()),
                ("expression", self.expression.is_some()),
            ],
        };
        for (name, present) in needed {
            if !present {
                errors.push(FieldError::new(
                    format!("workflow.nodes.{name}"),
                    "is required for this sweep mode",
                ));
            }
        }
    }

    /// Node ids that must be present in the graph for `mode`.
    pub fn required_nodes(&self, mode: SweepMode) -> Vec<NodeId> {
        let mode_nodes: Vec<Option<&NodeId>> = match mode {
            SweepMode::Axis => vec![
                self.positive_prompt.as_ref().map(|r| &r.node_id),
                self.negative_prompt.as_ref().map(|r| &r.node_id),
                self.sampler.as_ref(),
                self.lora.as_ref(),
            ],
            SweepMode::ImageBatch => vec![
                self.input_image.as_ref().map(|r| &r.node_id),
                self.expression.as_ref().map(|r| &r.node_id),
            ],
        };

        let mut ids: Vec<NodeId> = mode_nodes.into_iter().flatten().cloned().collect();
        for id in &self.required {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Configured node ids whose absence is only a warning for `mode`.
    pub fn optional_nodes(&self, mode: SweepMode) -> Vec<NodeId> {
        let required = self.required_nodes(mode);
        let mut candidates: Vec<Option<&NodeId>> = vec![
            self.save_image.as_ref().map(|r| &r.node_id),
            self.seed.as_ref().map(|r| &r.node_id),
        ];
        if mode == SweepMode::ImageBatch {
            candidates.push(self.sampler.as_ref());
        }

        let mut ids: Vec<NodeId> = Vec::new();
        for id in candidates.into_iter().flatten() {
            if !required.contains(id) && !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    pub fn prompt_bindings(&self, positive: &str, negative: &str) -> Vec<Binding> {
        let mut out = Vec::new();
        if let Some(r) = &self.positive_prompt {
            out.push(Binding::new(&r.node_id, r.input_or("text"), positive));
        }
        if let Some(r) = &self.negative_prompt {
            out.push(Binding::new(&r.node_id, r.input_or("text"), negative));
        }
        out
    }

    /// Sampler field bindings. The seed is bound separately.
    pub fn sampler_bindings(&self, sampler: &SamplerParams) -> Vec<Binding> {
        let Some(node) = &self.sampler else {
            return Vec::new();
        };
        let names = &self.sampler_inputs;
        let mut out = vec![
            Binding::new(node, &names.steps, sampler.steps),
            Binding::new(node, &names.cfg, sampler.cfg),
            Binding::new(node, &names.sampler_name, sampler.sampler_name.as_str()),
            Binding::new(node, &names.scheduler, sampler.scheduler.as_str()),
        ];
        if let Some(denoise) = sampler.denoise {
            out.push(Binding::new(node, &names.denoise, denoise));
        }
        out
    }

    pub fn lora_bindings(&self, lora: &LoraParams) -> Vec<Binding> {
        let Some(node) = &self.lora else {
            return Vec::new();
        };
        let names = &self.lora_inputs;
        vec![
            Binding::new(node, &names.name, lora.name.as_str()),
            Binding::new(node, &names.model_strength, lora.model_strength),
            Binding::new(node, &names.clip_strength, lora.clip_strength),
        ]
    }

    /// Seed goes to the dedicated seed node when configured, otherwise to
    /// the sampler node.
    pub fn seed_binding(&self, seed: Seed) -> Option<Binding> {
        if let Some(r) = &self.seed {
            return Some(Binding::new(&r.node_id, r.input_or("seed"), seed));
        }
        self.sampler
            .as_ref()
            .map(|node| Binding::new(node, &self.sampler_inputs.seed, seed))
    }

    pub fn filename_prefix_binding(&self, prefix: &str) -> Option<Binding> {
        self.save_image
            .as_ref()
            .map(|r| Binding::new(&r.node_id, r.input_or("filename_prefix"), prefix))
    }

    pub fn input_image_binding(&self, stored_name: &str) -> Option<Binding> {
        self.input_image
            .as_ref()
            .map(|r| Binding::new(&r.node_id, r.input_or("image"), stored_name))
    }

    pub fn expression_binding(&self, expression: &str) -> Option<Binding> {
        self.expression
            .as_ref()
            .map(|r| Binding::new(&r.node_id, r.input_or("expression"), expression))
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Check that every required node exists. Missing optional nodes are
/// logged but do not fail validation.
pub fn validate_graph(graph: &WorkflowGraph, required: &[NodeId], optional: &[NodeId]) -> bool {
    let mut valid = true;
    for id in required {
        if !graph.contains(id) {
            tracing::error!(node_id = %id, "Required node missing from workflow");
            valid = false;
        }
    }
    for id in optional {
        if !graph.contains(id) {
            tracing::warn!(node_id = %id, "Configured optional node missing from workflow");
        }
    }
    valid
}

/// The immutable base graph every run starts from.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    path: PathBuf,
    base: WorkflowGraph,
}

impl WorkflowTemplate {
    /// Load the base graph. A missing or malformed file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::Workflow(format!("Workflow file not found: {}", path.display()))
            } else {
                CoreError::io(path, e)
            }
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            CoreError::Workflow(format!("Workflow file {} is not JSON: {e}", path.display()))
        })?;
        let base = WorkflowGraph::from_value(value)?;

        tracing::info!(
            path = %path.display(),
            nodes = base.nodes.len(),
            "Loaded workflow"
        );

        Ok(Self {
            path: path.to_path_buf(),
            base,
        })
    }

    pub fn from_graph(path: impl Into<PathBuf>, base: WorkflowGraph) -> Self {
        Self {
            path: path.into(),
            base,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base(&self) -> &WorkflowGraph {
        &self.base
    }

    /// Deep copy of the base graph for one run.
    pub fn get_base(&self) -> WorkflowGraph {
        self.base.clone()
    }

    /// Fresh copy of the base graph with `bindings` applied.
    pub fn instantiate(&self, bindings: &[Binding]) -> (WorkflowGraph, ApplyReport) {
        let mut graph = self.get_base();
        let report = graph.apply(bindings);
        (graph, report)
    }

    pub fn validate(&self, required: &[NodeId], optional: &[NodeId]) -> bool {
        validate_graph(&self.base, required, optional)
    }
}
