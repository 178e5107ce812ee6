//! Workflow documents and seed randomization.
//!
//! A workflow is ComfyUI's API-format graph: a JSON object keyed by node
//! id, each node carrying a `class_type` and an `inputs` map. The harness
//! treats it as opaque and only ever rewrites the seed inputs so that
//! repeated runs of the same graph are not served from cache.

use rand::Rng;
use serde::Serialize;
use serde_json::Value;

/// Input names that hold sampler seeds.
pub const SEED_FIELDS: [&str; 2] = ["seed", "noise_seed"];

/// Upper bound (inclusive) for randomized seeds.
///
/// Stays below 2^53 so JavaScript consumers of the graph read it exactly.
pub const MAX_SEED: u64 = 100_000_000_000_000;

/// Errors raised while decoding a workflow document.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Workflow must be a JSON object keyed by node id, got {0}")]
    NotAnObject(&'static str),
}

/// An API-format workflow graph, passed through to the server untouched
/// apart from seed randomization.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct WorkflowDocument(Value);

impl WorkflowDocument {
    /// Decode a document from raw file contents.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WorkflowError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Wrap an already-decoded JSON value. Only objects are accepted.
    pub fn from_value(value: Value) -> Result<Self, WorkflowError> {
        match value {
            Value::Object(_) => Ok(Self(value)),
            Value::Array(_) => Err(WorkflowError::NotAnObject("an array")),
            Value::String(_) => Err(WorkflowError::NotAnObject("a string")),
            Value::Number(_) => Err(WorkflowError::NotAnObject("a number")),
            Value::Bool(_) => Err(WorkflowError::NotAnObject("a boolean")),
            Value::Null => Err(WorkflowError::NotAnObject("null")),
        }
    }

    /// The raw graph as sent in the `prompt` field of a submission.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Number of top-level nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.0.as_object().map_or(0, |nodes| nodes.len())
    }

    /// Overwrite every `seed` / `noise_seed` input with a fresh value in
    /// `1..=MAX_SEED`, drawing independently for each occurrence.
    ///
    /// Nodes without an `inputs` object, and inputs under any other name,
    /// are left exactly as they were. Returns the number of fields rewritten.
    pub fn randomize_seeds<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        let Some(nodes) = self.0.as_object_mut() else {
            return 0;
        };

        let mut updated = 0;
        for node in nodes.values_mut() {
            let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
                continue;
            };
            for field in SEED_FIELDS {
                if let Some(slot) = inputs.get_mut(field) {
                    *slot = Value::from(rng.random_range(1..=MAX_SEED));
                    updated += 1;
                }
            }
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    use super::*;

    fn sample_graph() -> Value {
        json!({
            "3": {
                "class_type": "KSampler",
                "inputs": {
                    "seed": 156680208700286u64,
                    "steps": 20,
                    "cfg": 8.0,
                    "model": ["4", 0]
                }
            },
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": "v1-5-pruned-emaonly.safetensors" }
            },
            "9": {
                "class_type": "KSamplerAdvanced",
                "inputs": { "noise_seed": 1, "seed": 2, "add_noise": "enable" }
            },
            "10": { "class_type": "Note" }
        })
    }

    #[test]
    fn rejects_non_object_documents() {
        assert_matches!(
            WorkflowDocument::from_slice(b"[1, 2, 3]"),
            Err(WorkflowError::NotAnObject("an array"))
        );
        assert_matches!(
            WorkflowDocument::from_slice(b"{not json"),
            Err(WorkflowError::Parse(_))
        );
    }

    #[test]
    fn counts_top_level_nodes() {
        let doc = WorkflowDocument::from_value(sample_graph()).unwrap();
        assert_eq!(doc.node_count(), 4);
    }

    #[test]
    fn randomize_touches_only_seed_fields() {
        let original = sample_graph();
        let mut doc = WorkflowDocument::from_value(original.clone()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let updated = doc.randomize_seeds(&mut rng);
        assert_eq!(updated, 3);

        let after = doc.as_value();
        for (node_id, node) in original.as_object().unwrap() {
            let new_node = &after[node_id];
            assert_eq!(new_node["class_type"], node["class_type"]);

            let Some(inputs) = node.get("inputs").and_then(Value::as_object) else {
                assert_eq!(new_node, node, "node {node_id} without inputs must be unchanged");
                continue;
            };
            for (key, value) in inputs {
                if SEED_FIELDS.contains(&key.as_str()) {
                    let seed = new_node["inputs"][key].as_u64().expect("seed must be an integer");
                    assert!((1..=MAX_SEED).contains(&seed));
                } else {
                    assert_eq!(&new_node["inputs"][key], value, "{node_id}.{key} changed");
                }
            }
            assert_eq!(
                new_node["inputs"].as_object().unwrap().len(),
                inputs.len(),
                "no inputs may be added or removed"
            );
        }
    }

    #[test]
    fn randomize_draws_independently_per_run() {
        let mut doc = WorkflowDocument::from_value(sample_graph()).unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        doc.randomize_seeds(&mut rng);
        let first = doc.as_value()["3"]["inputs"]["seed"].clone();
        doc.randomize_seeds(&mut rng);
        let second = doc.as_value()["3"]["inputs"]["seed"].clone();

        assert_ne!(first, second);
    }

    #[test]
    fn randomize_without_seed_fields_is_a_noop() {
        let graph = json!({
            "1": { "class_type": "LoadImage", "inputs": { "image": "in.png" } },
            "2": { "class_type": "SaveImage", "inputs": { "filename_prefix": "out" } }
        });
        let mut doc = WorkflowDocument::from_value(graph.clone()).unwrap();

        assert_eq!(doc.randomize_seeds(&mut rand::rng()), 0);
        assert_eq!(doc.as_value(), &graph);
    }

    #[test]
    fn serializes_transparently() {
        let doc = WorkflowDocument::from_value(sample_graph()).unwrap();
        assert_eq!(serde_json::to_value(&doc).unwrap(), sample_graph());
    }
}
