//! Configuration variants: named sets of environment overrides applied to
//! the server process for one measurement round.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// Name of the implicit variant with no overrides.
pub const DEFAULT_VARIANT_NAME: &str = "default";

/// A named set of environment-variable overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVariant {
    pub name: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Errors from decoding or validating a variant list.
#[derive(Debug, thiserror::Error)]
pub enum VariantError {
    #[error("Invalid variant list: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Variant list is empty")]
    Empty,

    #[error("Variant #{0} has an empty name")]
    EmptyName(usize),

    #[error("Duplicate variant name: {0}")]
    Duplicate(String),
}

impl ConfigVariant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            env: BTreeMap::new(),
        }
    }

    /// Add one override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl Default for ConfigVariant {
    fn default() -> Self {
        Self::new(DEFAULT_VARIANT_NAME)
    }
}

/// Decode a JSON array of `{name, env}` objects and validate it.
pub fn parse_variants(json: &str) -> Result<Vec<ConfigVariant>, VariantError> {
    let variants: Vec<ConfigVariant> = serde_json::from_str(json)?;
    validate_variants(&variants)?;
    Ok(variants)
}

/// Variant names must be non-empty and unique, and the list non-empty.
pub fn validate_variants(variants: &[ConfigVariant]) -> Result<(), VariantError> {
    if variants.is_empty() {
        return Err(VariantError::Empty);
    }
    let mut seen = HashSet::new();
    for (idx, variant) in variants.iter().enumerate() {
        if variant.name.trim().is_empty() {
            return Err(VariantError::EmptyName(idx));
        }
        if !seen.insert(variant.name.as_str()) {
            return Err(VariantError::Duplicate(variant.name.clone()));
        }
    }
    Ok(())
}
