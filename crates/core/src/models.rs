//! Model download catalog.
//!
//! Maps workflow file names to the download script (and its arguments)
//! that fetches the models the workflow needs. Matching is by keyword:
//! every keyword must appear in the file name and no exclusion may.
//! The first matching entry wins, so more specific entries come first.

use serde::Serialize;

/// One download action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelFamily {
    /// Human-readable name shown in listings.
    pub name: &'static str,
    /// Substrings that must all appear in the workflow file name.
    pub keywords: &'static [&'static str],
    /// Substrings that must not appear in the workflow file name.
    pub excludes: &'static [&'static str],
    /// Script file name, resolved against the script directory.
    pub script: &'static str,
    /// Arguments; the script runs once per argument, in order.
    pub args: &'static [&'static str],
}

impl ModelFamily {
    pub fn matches(&self, file_name: &str) -> bool {
        self.keywords.iter().all(|k| file_name.contains(k))
            && !self.excludes.iter().any(|e| file_name.contains(e))
    }
}

/// Known model families, most specific first.
pub const CATALOG: &[ModelFamily] = &[
    ModelFamily {
        name: "HunyuanVideo 1.5 - Image to Video (720p)",
        keywords: &["Hunyuan", "i2v"],
        excludes: &[],
        script: "get_hunyuan15.sh",
        args: &["common", "720p-i2v", "lora"],
    },
    ModelFamily {
        name: "HunyuanVideo 1.5 - Text to Video (720p)",
        keywords: &["Hunyuan", "t2v"],
        excludes: &[],
        script: "get_hunyuan15.sh",
        args: &["common", "720p-t2v", "lora"],
    },
    ModelFamily {
        name: "Wan 2.2 - Image to Video (14B)",
        keywords: &["Wan2.2", "I2V", "A14B"],
        excludes: &[],
        script: "get_wan22.sh",
        args: &["common", "14b-i2v", "lora"],
    },
    ModelFamily {
        name: "Wan 2.2 - Text to Video (14B)",
        keywords: &["Wan2.2", "T2V", "A14B"],
        excludes: &[],
        script: "get_wan22.sh",
        args: &["common", "14b-t2v", "lora"],
    },
    // Plain Qwen-Image entries must not swallow Qwen-Image-Edit workflows.
    ModelFamily {
        name: "Qwen Image + Lightning LoRA (4-steps)",
        keywords: &["Qwen-Image", "LoRA"],
        excludes: &["Edit"],
        script: "get_qwen_image.sh",
        args: &["3"],
    },
    ModelFamily {
        name: "Qwen Image (Base 20B)",
        keywords: &["Qwen-Image"],
        excludes: &["Edit"],
        script: "get_qwen_image.sh",
        args: &["1"],
    },
    ModelFamily {
        name: "Qwen Image Edit + Lightning LoRA",
        keywords: &["Qwen-Image-Edit", "LoRA"],
        excludes: &[],
        script: "get_qwen_image.sh",
        args: &["4"],
    },
    ModelFamily {
        name: "Qwen Image Edit (Base)",
        keywords: &["Qwen-Image-Edit"],
        excludes: &[],
        script: "get_qwen_image.sh",
        args: &["2"],
    },
];

/// Find the download action for a workflow file name.
pub fn match_workflow(file_name: &str) -> Option<&'static ModelFamily> {
    CATALOG.iter().find(|family| family.matches(file_name))
}

/// A workflow file paired with its download action, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowModels {
    pub file: String,
    pub family: Option<&'static ModelFamily>,
}

impl WorkflowModels {
    /// Listing label: the family name, or `Unknown: <file>`.
    pub fn label(&self) -> String {
        match self.family {
            Some(family) => family.name.to_string(),
            None => format!("Unknown: {}", self.file),
        }
    }
}

/// Match every file name and sort by listing label.
pub fn plan_downloads<I, S>(file_names: I) -> Vec<WorkflowModels>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut planned: Vec<WorkflowModels> = file_names
        .into_iter()
        .map(|file| {
            let file = file.into();
            WorkflowModels {
                family: match_workflow(&file),
                file,
            }
        })
        .collect();
    planned.sort_by_key(WorkflowModels::label);
    planned
}
