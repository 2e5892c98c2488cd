// Action References
// Parses `uses:` values into local or external action references

use crate::error::{EngineError, EngineResult};

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A parsed `uses:` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ActionRef {
    /// Composite action in the workspace: `./.github/actions/setup`
    Local { path: String },

    /// Versioned action from another repository: `owner/repo[/path]@version`
    External {
        owner: String,
        repo: String,
        path: Option<String>,
        version: String,
    },
}

impl ActionRef {
    /// Parse a reference such as `actions/checkout@v4` or `./ci/setup`.
    pub fn parse(reference: &str) -> EngineResult<Self> {
        let reference = reference.trim();

        if reference.is_empty() {
            return Err(EngineError::config("empty action reference"));
        }

        if reference.starts_with("docker://") {
            return Err(EngineError::config(format!(
                "container actions are not supported: '{}'",
                reference
            )));
        }

        if reference.starts_with("./") || reference == "." {
            let path = reference.trim_end_matches('/').to_string();
            return Ok(ActionRef::Local { path });
        }

        let (location, version) = reference.rsplit_once('@').ok_or_else(|| {
            EngineError::config(format!(
                "action reference '{}' is missing a version (expected owner/repo@version)",
                reference
            ))
        })?;

        if version.is_empty() {
            return Err(EngineError::config(format!(
                "action reference '{}' has an empty version",
                reference
            )));
        }

        let mut parts = location.splitn(3, '/');
        let owner = parts.next().unwrap_or_default();
        let repo = parts.next().unwrap_or_default();
        let path = parts
            .next()
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        if owner.is_empty() || repo.is_empty() {
            return Err(EngineError::config(format!(
                "action reference '{}' must be owner/repo[/path]@version",
                reference
            )));
        }

        Ok(ActionRef::External {
            owner: owner.to_string(),
            repo: repo.to_string(),
            path,
            version: version.to_string(),
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ActionRef::Local { .. })
    }

    /// Name without the version: `owner/repo/path`
    pub fn name(&self) -> String {
        match self {
            ActionRef::Local { path } => path.clone(),
            ActionRef::External {
                owner, repo, path, ..
            } => match path {
                Some(path) => format!("{}/{}/{}", owner, repo, path),
                None => format!("{}/{}", owner, repo),
            },
        }
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionRef::Local { path } => write!(f, "{}", path),
            ActionRef::External { version, .. } => write!(f, "{}@{}", self.name(), version),
        }
    }
}

impl FromStr for ActionRef {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
