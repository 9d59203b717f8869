//! Workflow templates, field bindings, and job payload building.
//!
//! A workflow template is a ComfyUI API-format graph: a JSON object
//! keyed by node id whose values carry a `class_type` and an `inputs`
//! map. The client never interprets the graph beyond writing runtime
//! values (prompt, model, dimensions, steps, seed) into the node inputs
//! named by a [`FieldBindings`] table.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// ComfyUI node class types used for binding discovery
// ---------------------------------------------------------------------------

/// CLIP text encode node class type.
const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";

/// Load checkpoint node class type.
const LOAD_CHECKPOINT_CLASS: &str = "CheckpointLoaderSimple";

/// Empty latent image node class type (carries output dimensions).
const EMPTY_LATENT_CLASS: &str = "EmptyLatentImage";

/// KSampler node class type in ComfyUI.
const KSAMPLER_CLASS: &str = "KSampler";

/// KSampler advanced node class type.
const KSAMPLER_ADVANCED_CLASS: &str = "KSamplerAdvanced";

// ---------------------------------------------------------------------------
// Fields and bindings
// ---------------------------------------------------------------------------

/// A logical runtime value the builder knows how to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowField {
    Prompt,
    Model,
    Width,
    Height,
    Steps,
    Seed,
}

impl WorkflowField {
    /// Every field, in injection order.
    pub const ALL: [WorkflowField; 6] = [
        WorkflowField::Prompt,
        WorkflowField::Model,
        WorkflowField::Width,
        WorkflowField::Height,
        WorkflowField::Steps,
        WorkflowField::Seed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowField::Prompt => "prompt",
            WorkflowField::Model => "model",
            WorkflowField::Width => "width",
            WorkflowField::Height => "height",
            WorkflowField::Steps => "steps",
            WorkflowField::Seed => "seed",
        }
    }
}

/// Where a field is written: `template[node_id].inputs[input_key]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTarget {
    pub node_id: String,
    pub input_key: String,
}

impl FieldTarget {
    pub fn new(node_id: impl Into<String>, input_key: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            input_key: input_key.into(),
        }
    }
}

/// Field-to-node binding table.
///
/// Unbound fields are skipped by [`build_payload`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldBindings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<FieldTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<FieldTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<FieldTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<FieldTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<FieldTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<FieldTarget>,
}

impl FieldBindings {
    /// The target for `field`, if bound.
    pub fn target(&self, field: WorkflowField) -> Option<&FieldTarget> {
        match field {
            WorkflowField::Prompt => self.prompt.as_ref(),
            WorkflowField::Model => self.model.as_ref(),
            WorkflowField::Width => self.width.as_ref(),
            WorkflowField::Height => self.height.as_ref(),
            WorkflowField::Steps => self.steps.as_ref(),
            WorkflowField::Seed => self.seed.as_ref(),
        }
    }

    /// Bind `field` to `target`, replacing any previous binding.
    pub fn bind(mut self, field: WorkflowField, target: FieldTarget) -> Self {
        let slot = match field {
            WorkflowField::Prompt => &mut self.prompt,
            WorkflowField::Model => &mut self.model,
            WorkflowField::Width => &mut self.width,
            WorkflowField::Height => &mut self.height,
            WorkflowField::Steps => &mut self.steps,
            WorkflowField::Seed => &mut self.seed,
        };
        *slot = Some(target);
        self
    }

    pub fn is_empty(&self) -> bool {
        WorkflowField::ALL.iter().all(|f| self.target(*f).is_none())
    }

    /// Discover bindings heuristically from node class types.
    ///
    /// Nodes are visited in [`compare_node_ids`] order and the first
    /// node of each class wins, so the result is stable for a given
    /// template.
    pub fn discover(template: &WorkflowTemplate) -> Self {
        let mut bindings = FieldBindings::default();

        for node_id in template.ordered_node_ids() {
            let Some(class_type) = template
                .node(node_id)
                .and_then(|n| n.get("class_type"))
                .and_then(Value::as_str)
            else {
                continue;
            };

            match class_type {
                CLIP_TEXT_ENCODE_CLASS if bindings.prompt.is_none() => {
                    bindings.prompt = Some(FieldTarget::new(node_id, "text"));
                }
                LOAD_CHECKPOINT_CLASS if bindings.model.is_none() => {
                    bindings.model = Some(FieldTarget::new(node_id, "ckpt_name"));
                }
                EMPTY_LATENT_CLASS if bindings.width.is_none() => {
                    bindings.width = Some(FieldTarget::new(node_id, "width"));
                    bindings.height = Some(FieldTarget::new(node_id, "height"));
                }
                KSAMPLER_CLASS if bindings.steps.is_none() => {
                    bindings.steps = Some(FieldTarget::new(node_id, "steps"));
                    bindings.seed = Some(FieldTarget::new(node_id, "seed"));
                }
                KSAMPLER_ADVANCED_CLASS if bindings.steps.is_none() => {
                    bindings.steps = Some(FieldTarget::new(node_id, "steps"));
                    bindings.seed = Some(FieldTarget::new(node_id, "noise_seed"));
                }
                _ => {}
            }
        }

        bindings
    }
}

// ---------------------------------------------------------------------------
// Runtime values
// ---------------------------------------------------------------------------

/// Runtime values for one generation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationParams {
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub seed: Option<u64>,
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    /// JSON value to inject for `field`, or `None` when not provided.
    ///
    /// An empty model name counts as not provided.
    pub fn value_for(&self, field: WorkflowField) -> Option<Value> {
        match field {
            WorkflowField::Prompt => self.prompt.clone().map(Value::from),
            WorkflowField::Model => self
                .model
                .as_deref()
                .filter(|m| !m.is_empty())
                .map(Value::from),
            WorkflowField::Width => self.width.map(Value::from),
            WorkflowField::Height => self.height.map(Value::from),
            WorkflowField::Steps => self.steps.map(Value::from),
            WorkflowField::Seed => self.seed.map(Value::from),
        }
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// A workflow graph keyed by node id. Also used for the built payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowTemplate(Map<String, Value>);

impl WorkflowTemplate {
    /// Parse template text as stored in settings.
    ///
    /// Never fails: blank text, text that is not JSON, and JSON that is
    /// not an object all yield an empty template.
    pub fn from_json_str(text: &str) -> Self {
        if text.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str(text) {
            Ok(value) => Self::from_value(value),
            Err(e) => {
                tracing::warn!(error = %e, "Workflow text is not valid JSON, using empty template");
                Self::default()
            }
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            other => {
                tracing::debug!(kind = json_kind(&other), "Workflow is not an object, using empty template");
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn node(&self, node_id: &str) -> Option<&Value> {
        self.0.get(node_id)
    }

    /// Node ids in [`compare_node_ids`] order.
    pub fn ordered_node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.0.keys().map(String::as_str).collect();
        ids.sort_by(|a, b| compare_node_ids(a, b));
        ids
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Write `value` into `inputs[input_key]` of `node_id`.
    ///
    /// Returns `false` (and leaves the template untouched) when the node
    /// is absent or has no `inputs` object.
    fn set_input(&mut self, node_id: &str, input_key: &str, value: Value) -> bool {
        match self
            .0
            .get_mut(node_id)
            .and_then(|node| node.get_mut("inputs"))
            .and_then(Value::as_object_mut)
        {
            Some(inputs) => {
                inputs.insert(input_key.to_string(), value);
                true
            }
            None => false,
        }
    }
}

/// Ordering for ComfyUI node ids: numeric ids ascending by value, then
/// any non-numeric ids lexicographically.
pub fn compare_node_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Build a concrete job payload from a template.
///
/// For each field that is both bound and provided, the value is written
/// into the bound node's `inputs`. A binding whose node is missing (or
/// has no `inputs` map) is skipped silently: the workflow simply does
/// not expose that control. The template itself is not modified.
pub fn build_payload(
    template: &WorkflowTemplate,
    bindings: &FieldBindings,
    params: &GenerationParams,
) -> WorkflowTemplate {
    let mut payload = template.clone();

    for field in WorkflowField::ALL {
        let (Some(target), Some(value)) = (bindings.target(field), params.value_for(field)) else {
            continue;
        };

        if !payload.set_input(&target.node_id, &target.input_key, value) {
            tracing::debug!(
                field = field.as_str(),
                node_id = %target.node_id,
                "Bound node not present in workflow, skipping field",
            );
        }
    }

    payload
}
