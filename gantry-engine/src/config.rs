// Engine Configuration
// Defaults, ~/.config/gantry/config.toml and GANTRY_* environment overrides

use crate::actions::{default_cache_dir, DEFAULT_MAX_DEPTH};
use crate::error::{EngineError, EngineResult};
use crate::execution::concurrency::QueuePolicy;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine configuration.
///
/// Sources, later wins:
/// - built-in defaults
/// - config file (`~/.config/gantry/config.toml`)
/// - environment variables (`GANTRY_*`)
/// - command-line flags, applied by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Maximum composite action nesting depth
    pub max_action_depth: usize,

    /// Handling of runs waiting for a busy concurrency group
    pub queue_policy: QueuePolicy,

    /// Directory holding pre-fetched external actions
    pub action_cache_dir: PathBuf,

    /// Shell for `run:` steps that name none; detected when unset
    pub default_shell: Option<String>,

    /// Whether step processes start from the engine's own environment
    pub inherit_env: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_action_depth: DEFAULT_MAX_DEPTH,
            queue_policy: QueuePolicy::default(),
            action_cache_dir: default_cache_dir(),
            default_shell: None,
            inherit_env: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default file and the environment
    pub fn load() -> EngineResult<Self> {
        let mut config = Self::load_from(&Self::config_dir().join("config.toml"))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load a config file; a missing file yields the defaults
    pub fn load_from(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| EngineError::config(format!("{}: {}", path.display(), e)))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("gantry"))
            .unwrap_or_else(|| PathBuf::from(".gantry"))
    }

    /// Apply `GANTRY_*` overrides read through `var`
    pub fn apply_env_overrides<F>(&mut self, var: F) -> EngineResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(depth) = var("GANTRY_MAX_ACTION_DEPTH") {
            self.max_action_depth = depth.trim().parse().map_err(|_| {
                EngineError::config(format!("GANTRY_MAX_ACTION_DEPTH: invalid number '{}'", depth))
            })?;
        }
        if let Some(policy) = var("GANTRY_QUEUE_POLICY") {
            self.queue_policy = policy.parse()?;
        }
        if let Some(dir) = var("GANTRY_ACTION_CACHE_DIR") {
            self.action_cache_dir = PathBuf::from(dir);
        }
        if let Some(shell) = var("GANTRY_SHELL") {
            self.default_shell = Some(shell);
        }
        if let Some(inherit) = var("GANTRY_INHERIT_ENV") {
            self.inherit_env = matches!(
                inherit.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_action_depth, 16);
        assert_eq!(config.queue_policy, QueuePolicy::Fifo);
        assert!(config.action_cache_dir.ends_with("actions"));
        assert!(config.inherit_env);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "max-action-depth = 4\nqueue-policy = \"supersede-pending\"\ndefault-shell = \"sh\"\n",
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.max_action_depth, 4);
        assert_eq!(config.queue_policy, QueuePolicy::SupersedePending);
        assert_eq!(config.default_shell.as_deref(), Some("sh"));
        assert!(config.inherit_env);
    }

    #[test]
    fn test_missing_and_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = EngineConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(missing, EngineConfig::default());

        let path = dir.path().join("bad.toml");
        fs::write(&path, "max-action-depth = \"deep\"").unwrap();
        assert!(matches!(
            EngineConfig::load_from(&path),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("GANTRY_MAX_ACTION_DEPTH", "8"),
            ("GANTRY_QUEUE_POLICY", "supersede-pending"),
            ("GANTRY_ACTION_CACHE_DIR", "/tmp/actions"),
            ("GANTRY_INHERIT_ENV", "false"),
        ]);
        let mut config = EngineConfig::default();
        config
            .apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.max_action_depth, 8);
        assert_eq!(config.queue_policy, QueuePolicy::SupersedePending);
        assert_eq!(config.action_cache_dir, PathBuf::from("/tmp/actions"));
        assert!(!config.inherit_env);

        let bad = HashMap::from([("GANTRY_MAX_ACTION_DEPTH", "many")]);
        assert!(config
            .apply_env_overrides(|key| bad.get(key).map(|v| v.to_string()))
            .is_err());
    }
}
