// Action Manifest Parser
// Parses action.yml / action.yaml files

use crate::workflow::models::Step;

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File names probed, in order, inside an action directory
pub const MANIFEST_FILES: [&str; 2] = ["action.yml", "action.yaml"];

/// Errors that can occur when parsing action manifests
#[derive(Debug, Error)]
pub enum ActionManifestError {
    #[error("Failed to read action manifest: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse action manifest: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Action manifest not found in: {0}")]
    NotFound(String),

    #[error("Invalid action manifest: {0}")]
    Invalid(String),
}

/// Action manifest (action.yml)
#[derive(Debug, Clone, Deserialize)]
pub struct ActionManifest {
    /// Action name
    #[serde(default)]
    pub name: Option<String>,

    /// Action description
    #[serde(default)]
    pub description: Option<String>,

    /// Declared inputs
    #[serde(default)]
    pub inputs: HashMap<String, ActionInput>,

    /// Declared outputs
    #[serde(default)]
    pub outputs: HashMap<String, ActionOutput>,

    /// How the action runs
    pub runs: ActionRuns,
}

/// Input declared by an action
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionInput {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// Output declared by an action
#[derive(Debug, Clone, Deserialize)]
pub struct ActionOutput {
    #[serde(default)]
    pub description: Option<String>,

    /// Expression evaluated after a composite action's steps
    #[serde(default)]
    pub value: Option<String>,
}

/// `runs:` section
#[derive(Debug, Clone, Deserialize)]
pub struct ActionRuns {
    /// `composite`, `node20`, `docker`, ...
    pub using: String,

    /// Steps of a composite action
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Entry point of a JavaScript action
    #[serde(default)]
    pub main: Option<String>,
}

impl ActionManifest {
    /// Parse a manifest from a file
    pub fn from_file(path: &Path) -> Result<Self, ActionManifestError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a manifest from a YAML string
    pub fn parse(content: &str) -> Result<Self, ActionManifestError> {
        let manifest: ActionManifest = serde_yaml::from_str(content)?;
        if manifest.is_composite() && manifest.runs.steps.is_empty() {
            return Err(ActionManifestError::Invalid(
                "composite action has no steps".to_string(),
            ));
        }
        Ok(manifest)
    }

    /// Locate and parse the manifest inside an action directory
    pub fn find_in_dir(dir: &Path) -> Result<(PathBuf, Self), ActionManifestError> {
        for file in MANIFEST_FILES {
            let path = dir.join(file);
            if path.is_file() {
                let manifest = Self::from_file(&path)?;
                return Ok((path, manifest));
            }
        }
        Err(ActionManifestError::NotFound(dir.display().to_string()))
    }

    pub fn is_composite(&self) -> bool {
        self.runs.using.eq_ignore_ascii_case("composite")
    }

    /// Default values for inputs that declare one
    pub fn input_defaults(&self) -> HashMap<String, String> {
        self.inputs
            .iter()
            .filter_map(|(name, input)| {
                input
                    .default
                    .as_ref()
                    .map(|d| (name.clone(), crate::expression::value_to_string(d)))
            })
            .collect()
    }
}
