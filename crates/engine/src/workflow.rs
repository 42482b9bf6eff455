//! API-format workflow template and per-job materialization.
//!
//! The workflow is loaded once from disk. Each job gets a copy with the
//! uploaded image name, the prompt text, and the seed behaviour filled in
//! at fixed node ids.

use std::path::Path;

use serde_json::Value;

/// Seed behaviour requested for every run.
pub const SEED_CONTROL_RANDOMIZE: &str = "randomize";

/// Node ids of the logical fields inside the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIds {
    pub load_image: String,
    pub clip_text: String,
    pub seed: String,
}

impl Default for NodeIds {
    fn default() -> Self {
        Self {
            load_image: "41".to_string(),
            clip_text: "6".to_string(),
            seed: "25".to_string(),
        }
    }
}

/// Errors from loading or filling in the workflow template.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("failed to read workflow {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("workflow is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// A configured node id is absent or has no `inputs` object.
    #[error("workflow has no {role} node with id {node_id}")]
    MissingNode { role: &'static str, node_id: String },
}

/// A validated workflow template.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    template: Value,
    nodes: NodeIds,
}

impl WorkflowTemplate {
    /// Wrap an already-parsed workflow, checking that every configured
    /// node exists.
    pub fn new(template: Value, nodes: NodeIds) -> Result<Self, WorkflowError> {
        for (role, node_id) in Self::roles(&nodes) {
            if inputs_of(&template, node_id).is_none() {
                return Err(WorkflowError::MissingNode {
                    role,
                    node_id: node_id.to_string(),
                });
            }
        }
        Ok(Self { template, nodes })
    }

    /// Read and validate a workflow file.
    pub async fn load(path: &Path, nodes: NodeIds) -> Result<Self, WorkflowError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| WorkflowError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let template: Value = serde_json::from_str(&raw)?;
        Self::new(template, nodes)
    }

    pub fn nodes(&self) -> &NodeIds {
        &self.nodes
    }

    /// Produce the job description for one run.
    pub fn materialize(&self, image_name: &str, prompt: &str) -> Result<Value, WorkflowError> {
        let mut workflow = self.template.clone();

        set_input(
            &mut workflow,
            "seed",
            &self.nodes.seed,
            "control_after_generate",
            Value::from(SEED_CONTROL_RANDOMIZE),
        )?;
        set_input(
            &mut workflow,
            "load image",
            &self.nodes.load_image,
            "image",
            Value::from(image_name),
        )?;
        set_input(
            &mut workflow,
            "prompt text",
            &self.nodes.clip_text,
            "text",
            Value::from(prompt),
        )?;

        Ok(workflow)
    }

    fn roles(nodes: &NodeIds) -> [(&'static str, &str); 3] {
        [
            ("load image", nodes.load_image.as_str()),
            ("prompt text", nodes.clip_text.as_str()),
            ("seed", nodes.seed.as_str()),
        ]
    }
}

fn inputs_of<'a>(workflow: &'a Value, node_id: &str) -> Option<&'a serde_json::Map<String, Value>> {
    workflow.get(node_id)?.get("inputs")?.as_object()
}

fn set_input(
    workflow: &mut Value,
    role: &'static str,
    node_id: &str,
    key: &str,
    value: Value,
) -> Result<(), WorkflowError> {
    let inputs = workflow
        .get_mut(node_id)
        .and_then(|node| node.get_mut("inputs"))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| WorkflowError::MissingNode {
            role,
            node_id: node_id.to_string(),
        })?;
    inputs.insert(key.to_string(), value);
    Ok(())
}
