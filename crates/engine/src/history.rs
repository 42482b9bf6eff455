//! Extraction of output images from `GET /history/{prompt_id}`.

use serde::Deserialize;

/// Reference to one image stored by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

impl OutputImage {
    /// File extension of the stored image, `png` when it has none.
    pub fn extension(&self) -> &str {
        std::path::Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("png")
    }
}

/// Return the first image listed under any node's outputs for
/// `prompt_id`, or `None` if the execution produced no image.
///
/// Nodes are visited in key order; within a node only the first image
/// is considered.
pub fn first_output_image(history: &serde_json::Value, prompt_id: &str) -> Option<OutputImage> {
    let outputs = history.get(prompt_id)?.get("outputs")?.as_object()?;

    outputs.values().find_map(|node_output| {
        let first = node_output.get("images")?.as_array()?.first()?;
        serde_json::from_value(first.clone()).ok()
    })
}
