// Action Resolver
// Resolves `uses:` references into executable units with a cycle guard

use crate::actions::cache::{fetch_key, ActionFetcher};
use crate::actions::manifest::{ActionInput, ActionManifest, ActionManifestError};
use crate::actions::reference::ActionRef;
use crate::error::{EngineError, EngineResult};
use crate::workflow::definition::{StepSpec, WorkflowDefinition};
use crate::workflow::models::RunDefaults;
use crate::workflow::parser::WorkflowParser;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Default nesting limit for composite actions
pub const DEFAULT_MAX_DEPTH: usize = 16;

/// A resolved action, ready for the step executor.
#[derive(Debug, Clone)]
pub enum ExecutableUnit {
    /// Steps run in-process by the step executor
    Composite(Arc<CompositeAction>),
    /// Opaque action handed to the `ActionHost`
    External(Arc<ExternalAction>),
}

impl ExecutableUnit {
    pub fn identifier(&self) -> &str {
        match self {
            ExecutableUnit::Composite(action) => &action.identifier,
            ExecutableUnit::External(action) => &action.identifier,
        }
    }

    /// Number of nesting levels this unit occupies
    fn height(&self) -> usize {
        match self {
            ExecutableUnit::Composite(action) => action.height,
            ExecutableUnit::External(_) => 1,
        }
    }
}

/// A composite action with its nested steps already resolved
#[derive(Debug)]
pub struct CompositeAction {
    pub identifier: String,
    pub name: String,
    pub dir: PathBuf,
    pub inputs: HashMap<String, ActionInput>,
    pub input_defaults: HashMap<String, String>,
    /// Output name and its value expression
    pub outputs: Vec<(String, String)>,
    pub steps: Vec<ResolvedStep>,
    height: usize,
}

/// An external action that is not executed in-process
#[derive(Debug)]
pub struct ExternalAction {
    pub identifier: String,
    pub reference: ActionRef,
    pub fetch_key: String,
    /// Local copy of the action, when the fetcher has one
    pub dir: Option<PathBuf>,
    /// `runs.using` of the local copy
    pub using: Option<String>,
}

/// A step paired with the unit its `uses:` resolved to
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub spec: StepSpec,
    pub unit: Option<ExecutableUnit>,
}

/// Resolves action references relative to a workspace.
pub struct ActionResolver {
    workspace: PathBuf,
    fetcher: Arc<dyn ActionFetcher>,
    max_depth: usize,
    /// Fully resolved units by identifier
    resolved: RwLock<HashMap<String, ExecutableUnit>>,
}

impl ActionResolver {
    pub fn new(workspace: impl Into<PathBuf>, fetcher: Arc<dyn ActionFetcher>) -> Self {
        Self {
            workspace: workspace.into(),
            fetcher,
            max_depth: DEFAULT_MAX_DEPTH,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Resolve a single reference into an executable unit
    pub async fn resolve(&self, reference: &ActionRef) -> EngineResult<ExecutableUnit> {
        let mut path = Vec::new();
        self.resolve_at(reference, &mut path).await
    }

    /// Resolve every `uses:` of a step list
    pub async fn resolve_steps(&self, steps: &[StepSpec]) -> EngineResult<Vec<ResolvedStep>> {
        let mut path = Vec::new();
        self.resolve_steps_at(steps, &mut path).await
    }

    /// Resolve all actions of a workflow without running anything.
    ///
    /// Resolution problems are reported as configuration errors.
    pub async fn preflight(&self, workflow: &WorkflowDefinition) -> EngineResult<()> {
        for job in &workflow.jobs {
            self.resolve_steps(&job.steps).await.map_err(|e| match e {
                EngineError::Config(_) => e,
                other => EngineError::config(format!("job '{}': {}", job.id, other)),
            })?;
        }
        Ok(())
    }

    fn resolve_steps_at<'a>(
        &'a self,
        steps: &'a [StepSpec],
        path: &'a mut Vec<String>,
    ) -> BoxFuture<'a, EngineResult<Vec<ResolvedStep>>> {
        Box::pin(async move {
            let mut resolved = Vec::with_capacity(steps.len());
            for spec in steps {
                let unit = match spec.action_ref() {
                    Some(reference) => Some(self.resolve_at(reference, path).await?),
                    None => None,
                };
                resolved.push(ResolvedStep {
                    spec: spec.clone(),
                    unit,
                });
            }
            Ok(resolved)
        })
    }

    fn resolve_at<'a>(
        &'a self,
        reference: &'a ActionRef,
        path: &'a mut Vec<String>,
    ) -> BoxFuture<'a, EngineResult<ExecutableUnit>> {
        Box::pin(async move {
            let identifier = self.identifier(reference);

            if path.contains(&identifier) {
                let mut chain = path.clone();
                chain.push(identifier);
                warn!(chain = %chain.join(" -> "), "cyclic action reference");
                return Err(EngineError::CyclicAction { chain });
            }

            let cached = self.resolved.read().await.get(&identifier).cloned();
            if let Some(unit) = cached {
                self.check_depth(&identifier, path.len() + unit.height())?;
                return Ok(unit);
            }

            self.check_depth(&identifier, path.len() + 1)?;
            debug!(action = %identifier, depth = path.len() + 1, "resolving action");

            let unit = match reference {
                ActionRef::Local { path: local } => {
                    let dir = self.workspace.join(strip_dot(local));
                    path.push(identifier.clone());
                    let result = self.load_dir(&identifier, &dir, path).await;
                    path.pop();
                    match result? {
                        Some(unit) => unit,
                        None => {
                            return Err(EngineError::config(format!(
                                "local action '{}' is not a composite action",
                                identifier
                            )))
                        }
                    }
                }
                ActionRef::External { .. } => {
                    let key = fetch_key(reference).unwrap_or_else(|| identifier.clone());
                    let dir = self
                        .fetcher
                        .fetch(reference, &key)
                        .await
                        .map_err(|e| EngineError::ActionNotFound(e.to_string()))?;

                    let loaded = match &dir {
                        Some(dir) => {
                            path.push(identifier.clone());
                            let result = self.load_dir(&identifier, dir, path).await;
                            path.pop();
                            result?
                        }
                        None => None,
                    };

                    match loaded {
                        Some(unit) => unit,
                        None => {
                            let using = match &dir {
                                Some(dir) => ActionManifest::find_in_dir(dir)
                                    .ok()
                                    .map(|(_, manifest)| manifest.runs.using),
                                None => None,
                            };
                            ExecutableUnit::External(Arc::new(ExternalAction {
                                identifier: identifier.clone(),
                                reference: reference.clone(),
                                fetch_key: key,
                                dir,
                                using,
                            }))
                        }
                    }
                }
            };

            self.resolved
                .write()
                .await
                .insert(identifier, unit.clone());
            Ok(unit)
        })
    }

    /// Load an action directory. Returns `None` for non-composite actions.
    async fn load_dir(
        &self,
        identifier: &str,
        dir: &Path,
        path: &mut Vec<String>,
    ) -> EngineResult<Option<ExecutableUnit>> {
        let (manifest_path, manifest) = match ActionManifest::find_in_dir(dir) {
            Ok(found) => found,
            Err(ActionManifestError::NotFound(location)) => {
                return if identifier.starts_with("./") {
                    Err(EngineError::ActionNotFound(format!(
                        "{} (no action.yml in {})",
                        identifier, location
                    )))
                } else {
                    Ok(None)
                }
            }
            Err(e) => {
                return Err(EngineError::config(format!(
                    "action '{}': {}",
                    identifier, e
                )))
            }
        };

        if !manifest.is_composite() {
            return Ok(None);
        }

        let owner = format!("action '{}'", identifier);
        WorkflowParser::validate_steps(&owner, &manifest.runs.steps)?;
        let specs = WorkflowParser::compile_steps(&manifest.runs.steps, &RunDefaults::default())?;
        let steps = self.resolve_steps_at(&specs, path).await?;

        let height = 1 + steps
            .iter()
            .filter_map(|s| s.unit.as_ref().map(ExecutableUnit::height))
            .max()
            .unwrap_or(0);

        let mut outputs: Vec<(String, String)> = manifest
            .outputs
            .iter()
            .filter_map(|(name, output)| output.value.clone().map(|v| (name.clone(), v)))
            .collect();
        outputs.sort();

        debug!(
            action = %identifier,
            manifest = %manifest_path.display(),
            steps = steps.len(),
            "loaded composite action"
        );

        Ok(Some(ExecutableUnit::Composite(Arc::new(CompositeAction {
            identifier: identifier.to_string(),
            name: manifest.name.clone().unwrap_or_else(|| identifier.to_string()),
            dir: dir.to_path_buf(),
            input_defaults: manifest.input_defaults(),
            inputs: manifest.inputs,
            outputs,
            steps,
            height,
        }))))
    }

    fn check_depth(&self, identifier: &str, depth: usize) -> EngineResult<()> {
        if depth > self.max_depth {
            return Err(EngineError::config(format!(
                "action '{}' exceeds the maximum nesting depth of {}",
                identifier, self.max_depth
            )));
        }
        Ok(())
    }

    fn identifier(&self, reference: &ActionRef) -> String {
        match reference {
            ActionRef::Local { path } => {
                let normalized: Vec<String> = Path::new(strip_dot(path))
                    .components()
                    .filter_map(|c| match c {
                        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                        _ => None,
                    })
                    .collect();
                format!("./{}", normalized.join("/"))
            }
            ActionRef::External { .. } => reference.to_string(),
        }
    }
}

fn strip_dot(path: &str) -> &str {
    path.strip_prefix("./").unwrap_or(path.trim_start_matches('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::cache::ActionCache;
    use std::fs;

    fn write_action(root: &Path, rel: &str, body: &str) {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("action.yml"), body).unwrap();
    }

    fn resolver(workspace: &Path, cache: &Path) -> ActionResolver {
        ActionResolver::new(workspace, Arc::new(ActionCache::with_cache_dir(cache)))
    }

    fn composite(steps: &str) -> String {
        format!("runs:\n  using: composite\n  steps:\n{}", steps)
    }

    #[tokio::test]
    async fn test_resolve_local_composite() {
        let ws = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_action(
            ws.path(),
            ".github/actions/setup",
            "name: Setup\ninputs:\n  toolchain:\n    default: stable\noutputs:\n  v:\n    value: ${{ steps.a.outputs.v }}\nruns:\n  using: composite\n  steps:\n    - id: a\n      run: echo v=1 >> $GITHUB_OUTPUT\n",
        );

        let unit = resolver(ws.path(), cache.path())
            .resolve(&ActionRef::parse("./.github/actions/setup").unwrap())
            .await
            .unwrap();

        match unit {
            ExecutableUnit::Composite(action) => {
                assert_eq!(action.identifier, "./.github/actions/setup");
                assert_eq!(action.name, "Setup");
                assert_eq!(action.steps.len(), 1);
                assert_eq!(
                    action.input_defaults.get("toolchain"),
                    Some(&"stable".to_string())
                );
                assert_eq!(action.outputs[0].0, "v");
            }
            other => panic!("expected composite, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_missing_local_action() {
        let ws = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let err = resolver(ws.path(), cache.path())
            .resolve(&ActionRef::parse("./missing").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ActionNotFound(_)));
    }

    #[tokio::test]
    async fn test_detect_cycle() {
        let ws = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_action(ws.path(), "a", &composite("    - uses: ./b\n"));
        write_action(ws.path(), "b", &composite("    - uses: ./a\n"));

        let err = resolver(ws.path(), cache.path())
            .resolve(&ActionRef::parse("./a").unwrap())
            .await
            .unwrap_err();

        match err {
            EngineError::CyclicAction { chain } => {
                assert_eq!(chain, vec!["./a", "./b", "./a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_self_reference_is_cycle() {
        let ws = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_action(ws.path(), "loop", &composite("    - uses: ./loop/\n"));

        let err = resolver(ws.path(), cache.path())
            .resolve(&ActionRef::parse("./loop").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CyclicAction { .. }));
    }

    #[tokio::test]
    async fn test_diamond_is_not_a_cycle() {
        let ws = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_action(ws.path(), "leaf", &composite("    - run: echo leaf\n"));
        write_action(ws.path(), "left", &composite("    - uses: ./leaf\n"));
        write_action(
            ws.path(),
            "top",
            &composite("    - uses: ./left\n    - uses: ./leaf\n"),
        );

        let unit = resolver(ws.path(), cache.path())
            .resolve(&ActionRef::parse("./top").unwrap())
            .await
            .unwrap();
        assert_eq!(unit.height(), 3);
    }

    #[tokio::test]
    async fn test_max_depth() {
        let ws = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_action(ws.path(), "d1", &composite("    - uses: ./d2\n"));
        write_action(ws.path(), "d2", &composite("    - uses: ./d3\n"));
        write_action(ws.path(), "d3", &composite("    - run: echo deep\n"));

        let r = resolver(ws.path(), cache.path()).with_max_depth(2);
        let err = r
            .resolve(&ActionRef::parse("./d1").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(ref m) if m.contains("maximum nesting depth")));

        let r = resolver(ws.path(), cache.path()).with_max_depth(3);
        assert!(r.resolve(&ActionRef::parse("./d1").unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn test_external_action_is_opaque_when_not_cached() {
        let ws = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let unit = resolver(ws.path(), cache.path())
            .resolve(&ActionRef::parse("actions/checkout@v4").unwrap())
            .await
            .unwrap();

        match unit {
            ExecutableUnit::External(action) => {
                assert_eq!(action.fetch_key, "actions/checkout@v4");
                assert!(action.dir.is_none());
            }
            other => panic!("expected external, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cached_external_composite() {
        let ws = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_action(
            cache.path(),
            "acme/setup/v1",
            &composite("    - run: echo from cache\n"),
        );
        write_action(
            cache.path(),
            "acme/node/v1",
            "runs:\n  using: node20\n  main: index.js\n",
        );

        let r = resolver(ws.path(), cache.path());
        let unit = r
            .resolve(&ActionRef::parse("acme/setup@v1").unwrap())
            .await
            .unwrap();
        assert!(matches!(unit, ExecutableUnit::Composite(_)));

        let unit = r
            .resolve(&ActionRef::parse("acme/node@v1").unwrap())
            .await
            .unwrap();
        match unit {
            ExecutableUnit::External(action) => {
                assert_eq!(action.using.as_deref(), Some("node20"));
            }
            other => panic!("expected external, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_preflight_reports_cycle_as_config_error() {
        let ws = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_action(ws.path(), "a", &composite("    - uses: ./a\n"));

        let workflow = WorkflowParser::load(
            "on: push\njobs:\n  build:\n    steps:\n      - uses: ./a\n",
        )
        .unwrap();
        let err = resolver(ws.path(), cache.path())
            .preflight(&workflow)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("cyclic action reference"));
    }
}
