// Actions Module
// Action references, action.yml manifests, the local action cache and the resolver

pub mod cache;
pub mod manifest;
pub mod reference;
pub mod resolver;

pub use cache::{default_cache_dir, fetch_key, ActionCache, ActionFetchError, ActionFetcher};
pub use manifest::{ActionInput, ActionManifest, ActionManifestError, ActionOutput, ActionRuns};
pub use reference::ActionRef;
pub use resolver::{
    ActionResolver, CompositeAction, ExecutableUnit, ExternalAction, ResolvedStep,
    DEFAULT_MAX_DEPTH,
};
