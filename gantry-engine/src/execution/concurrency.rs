// Concurrency Group Manager
// At most one admitted run per concurrency key, with cancel-in-progress and FIFO queueing

use crate::error::{EngineError, EngineResult};
use crate::execution::cancel::CancelHandle;
use crate::execution::context::RunContext;
use crate::expression::ExpressionEngine;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

/// What happens to runs already waiting when another run queues for the key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Every queued run eventually starts, in arrival order
    #[default]
    Fifo,
    /// A newly queued run replaces the runs waiting before it
    SupersedePending,
}

impl std::str::FromStr for QueuePolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(QueuePolicy::Fifo),
            "supersede-pending" | "supersede_pending" => Ok(QueuePolicy::SupersedePending),
            other => Err(EngineError::config(format!("unknown queue policy '{}'", other))),
        }
    }
}

/// Result of asking to admit a run
#[derive(Debug)]
pub enum AdmissionDecision {
    /// No active run for the key
    Start,
    /// The previous active run was cancelled and this one starts
    CancelAndStart(Uuid),
    /// Wait for the active run to finish
    Queue(QueuedRun),
}

/// Outcome of waiting in a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// The run is now the active run for its key
    Start,
    /// A newer run took this run's place before it started
    Superseded(Uuid),
}

/// A run waiting for its concurrency group
#[derive(Debug)]
pub struct QueuedRun {
    rx: oneshot::Receiver<Promotion>,
}

impl QueuedRun {
    /// Wait until the run is promoted or superseded
    pub async fn promoted(self) -> Promotion {
        // The manager only drops a waiter after sending to it
        self.rx.await.unwrap_or(Promotion::Superseded(Uuid::nil()))
    }
}

struct ActiveRun {
    run_id: Uuid,
    cancel: CancelHandle,
}

struct Waiting {
    run_id: Uuid,
    cancel: CancelHandle,
    tx: oneshot::Sender<Promotion>,
}

#[derive(Default)]
struct GroupState {
    active: Option<ActiveRun>,
    queue: VecDeque<Waiting>,
}

impl GroupState {
    fn supersede_queue(&mut self, by: Uuid) {
        for waiting in self.queue.drain(..) {
            debug!(run_id = %waiting.run_id, superseded_by = %by, "queued run superseded");
            let _ = waiting.tx.send(Promotion::Superseded(by));
        }
    }
}

/// Owns all concurrency group state.
///
/// Each key has its own mutex; admission and release for a key are a single
/// critical section and never await. A group's mutex is always taken while
/// the group map is locked, so an idle group can be dropped from the map
/// without racing a concurrent admission.
#[derive(Default)]
pub struct ConcurrencyManager {
    policy: QueuePolicy,
    groups: Mutex<HashMap<String, Arc<Mutex<GroupState>>>>,
}

impl ConcurrencyManager {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }


    /// Admit `run_id` into the group for `key`.
    ///
    /// `cancel` is fired when a later run preempts this one.
    pub fn admit(
        &self,
        key: &str,
        run_id: Uuid,
        cancel_in_progress: bool,
        cancel: CancelHandle,
    ) -> AdmissionDecision {
        let mut groups = lock(&self.groups);
        let group = groups.entry(key.to_string()).or_default().clone();
        let mut state = lock(&group);
        drop(groups);

        let previous = match &state.active {
            None => {
                state.active = Some(ActiveRun { run_id, cancel });
                debug!(%run_id, key, "run admitted");
                return AdmissionDecision::Start;
            }
            Some(active) => active.run_id,
        };

        if cancel_in_progress {
            if let Some(active) = state.active.take() {
                active.cancel.cancel();
            }
            state.supersede_queue(run_id);
            state.active = Some(ActiveRun { run_id, cancel });
            info!(%run_id, key, cancelled = %previous, "run preempted previous run");
            return AdmissionDecision::CancelAndStart(previous);
        }

        if self.policy == QueuePolicy::SupersedePending {
            state.supersede_queue(run_id);
        }
        let (tx, rx) = oneshot::channel();
        state.queue.push_back(Waiting { run_id, cancel, tx });
        info!(%run_id, key, active = %previous, position = state.queue.len(), "run queued");
        AdmissionDecision::Queue(QueuedRun { rx })
    }

    /// Clear the active slot held by `run_id` and promote the queue head.
    /// A group left with no active run and no waiters is removed.
    pub fn release(&self, key: &str, run_id: Uuid) {
        let mut groups = lock(&self.groups);
        let Some(group) = groups.get(key).cloned() else {
            return;
        };
        let mut state = lock(&group);

        match &state.active {
            Some(active) if active.run_id == run_id => state.active = None,
            _ => return,
        }
        debug!(%run_id, key, "run released");

        while let Some(next) = state.queue.pop_front() {
            if next.tx.send(Promotion::Start).is_ok() {
                info!(run_id = %next.run_id, key, "queued run promoted");
                state.active = Some(ActiveRun {
                    run_id: next.run_id,
                    cancel: next.cancel,
                });
                break;
            }
        }

        if state.active.is_none() && state.queue.is_empty() {
            drop(state);
            groups.remove(key);
            debug!(key, "concurrency group cleared");
        }
    }

    /// Number of groups currently tracked
    pub fn group_count(&self) -> usize {
        lock(&self.groups).len()
    }

    /// Active run for `key`, if any
    pub fn active_run(&self, key: &str) -> Option<Uuid> {
        let groups = lock(&self.groups);
        let group = groups.get(key)?;
        let state = lock(group);
        state.active.as_ref().map(|a| a.run_id)
    }

    /// Number of runs waiting for `key`
    pub fn queued(&self, key: &str) -> usize {
        let groups = lock(&self.groups);
        groups.get(key).map(|g| lock(g).queue.len()).unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Render a concurrency key template for a run.
///
/// `${{ }}` expressions see the `github` context. Bare placeholders
/// `${workflow}`, `${ref}`, `${event}`, `${head_ref}` and `${run_id}` are
/// also accepted.
pub fn render_key(template: &str, run: &RunContext) -> EngineResult<String> {
    let mut expanded = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        if after.starts_with('{') {
            // Expression, left for interpolation
            expanded.push_str("${");
            rest = after;
            continue;
        }
        let end = after.find('}').ok_or_else(|| {
            EngineError::config(format!("unterminated placeholder in concurrency group '{}'", template))
        })?;
        expanded.push_str(&placeholder(&after[..end], run)?);
        rest = &after[end + 1..];
    }
    expanded.push_str(rest);

    let key = ExpressionEngine::interpolate(&expanded, &run.expression_context())
        .map_err(|e| EngineError::config(format!("concurrency group: {}", e.message)))?;

    if key.trim().is_empty() {
        return Err(EngineError::config(format!(
            "concurrency group '{}' rendered to an empty key",
            template
        )));
    }
    Ok(key)
}

fn placeholder(name: &str, run: &RunContext) -> EngineResult<String> {
    let event = &run.event;
    Ok(match name.trim() {
        "workflow" => run.workflow.name.clone(),
        "ref" => event.git_ref.clone(),
        "event" => event.kind.clone(),
        "head_ref" => event.head_ref.clone().unwrap_or_default(),
        "run_id" => run.run_id.to_string(),
        other => {
            return Err(EngineError::config(format!(
                "unknown placeholder '${{{}}}' in concurrency group",
                other
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::cancel::cancel_pair;
    use crate::trigger::Event;
    use crate::workflow::definition::{TriggerSet, WorkflowDefinition};
    use std::time::Duration;

    fn handle() -> CancelHandle {
        cancel_pair().0
    }

    #[test]
    fn test_first_run_starts() {
        let manager = ConcurrencyManager::default();
        let run = Uuid::new_v4();
        assert!(matches!(
            manager.admit("wf-123", run, true, handle()),
            AdmissionDecision::Start
        ));
        assert_eq!(manager.active_run("wf-123"), Some(run));
    }

    #[test]
    fn test_cancel_in_progress() {
        let manager = ConcurrencyManager::default();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let first_handle = handle();

        manager.admit("wf-123", first, true, first_handle.clone());
        let decision = manager.admit("wf-123", second, true, handle());

        match decision {
            AdmissionDecision::CancelAndStart(previous) => assert_eq!(previous, first),
            other => panic!("unexpected decision {:?}", other),
        }
        assert!(first_handle.is_cancelled());
        assert_eq!(manager.active_run("wf-123"), Some(second));

        // The cancelled run releasing late must not clear the new run
        manager.release("wf-123", first);
        assert_eq!(manager.active_run("wf-123"), Some(second));
    }

    #[test]
    fn test_keys_are_independent() {
        let manager = ConcurrencyManager::default();
        manager.admit("a", Uuid::new_v4(), false, handle());
        assert!(matches!(
            manager.admit("b", Uuid::new_v4(), false, handle()),
            AdmissionDecision::Start
        ));
    }

    #[tokio::test]
    async fn test_fifo_queue() {
        let manager = ConcurrencyManager::new(QueuePolicy::Fifo);
        let (first, second, third) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        manager.admit("k", first, false, handle());
        let AdmissionDecision::Queue(q2) = manager.admit("k", second, false, handle()) else {
            panic!("expected queue");
        };
        let AdmissionDecision::Queue(q3) = manager.admit("k", third, false, handle()) else {
            panic!("expected queue");
        };
        assert_eq!(manager.queued("k"), 2);

        manager.release("k", first);
        assert_eq!(q2.promoted().await, Promotion::Start);
        assert_eq!(manager.active_run("k"), Some(second));

        manager.release("k", second);
        assert_eq!(q3.promoted().await, Promotion::Start);
        assert_eq!(manager.active_run("k"), Some(third));

        manager.release("k", third);
        assert_eq!(manager.active_run("k"), None);
        assert_eq!(manager.group_count(), 0);
    }

    #[test]
    fn test_finished_groups_are_cleared() {
        let manager = ConcurrencyManager::default();
        for n in 0..1000 {
            let key = format!("pr-{}", n);
            let run = Uuid::new_v4();
            manager.admit(&key, run, false, handle());
            manager.release(&key, run);
        }
        assert_eq!(manager.group_count(), 0);

        // A stale release for a cleared group is a no-op
        manager.release("pr-1", Uuid::new_v4());
        assert_eq!(manager.group_count(), 0);

        let run = Uuid::new_v4();
        assert!(matches!(
            manager.admit("pr-1", run, false, handle()),
            AdmissionDecision::Start
        ));
        assert_eq!(manager.group_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_admit_release_churn_keeps_one_active() {
        let manager = Arc::new(ConcurrencyManager::default());
        let mut tasks = Vec::new();

        for _ in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let run_id = Uuid::new_v4();
                    let admitted = match manager.admit("shared", run_id, false, handle()) {
                        AdmissionDecision::Start => true,
                        AdmissionDecision::Queue(queued) => {
                            queued.promoted().await == Promotion::Start
                        }
                        AdmissionDecision::CancelAndStart(_) => unreachable!(),
                    };
                    assert!(admitted);
                    assert_eq!(manager.active_run("shared"), Some(run_id));
                    manager.release("shared", run_id);
                }
            }));
        }

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(manager.active_run("shared"), None);
        assert_eq!(manager.group_count(), 0);
    }

    #[tokio::test]
    async fn test_supersede_pending() {
        let manager = ConcurrencyManager::new(QueuePolicy::SupersedePending);
        let (first, second, third) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        manager.admit("k", first, false, handle());
        let AdmissionDecision::Queue(q2) = manager.admit("k", second, false, handle()) else {
            panic!("expected queue");
        };
        let AdmissionDecision::Queue(q3) = manager.admit("k", third, false, handle()) else {
            panic!("expected queue");
        };

        assert_eq!(q2.promoted().await, Promotion::Superseded(third));
        manager.release("k", first);
        assert_eq!(q3.promoted().await, Promotion::Start);
    }

    #[tokio::test]
    async fn test_cancel_in_progress_supersedes_queue() {
        let manager = ConcurrencyManager::default();
        let (first, second, third) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        manager.admit("k", first, false, handle());
        let AdmissionDecision::Queue(q2) = manager.admit("k", second, false, handle()) else {
            panic!("expected queue");
        };
        manager.admit("k", third, true, handle());
        assert_eq!(q2.promoted().await, Promotion::Superseded(third));
        assert_eq!(manager.active_run("k"), Some(third));
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let manager = ConcurrencyManager::default();
        let (first, second, third) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        manager.admit("k", first, false, handle());
        let q2 = manager.admit("k", second, false, handle());
        let AdmissionDecision::Queue(q3) = manager.admit("k", third, false, handle()) else {
            panic!("expected queue");
        };
        drop(q2);

        manager.release("k", first);
        assert_eq!(q3.promoted().await, Promotion::Start);
        assert_eq!(manager.active_run("k"), Some(third));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_keeps_one_active() {
        let manager = Arc::new(ConcurrencyManager::default());
        let mut tasks = Vec::new();

        for _ in 0..32 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let run_id = Uuid::new_v4();
                let (handle, _token) = cancel_pair();
                let decision = manager.admit("wf-123", run_id, true, handle.clone());
                (run_id, handle, decision)
            }));
        }

        let mut starts = 0;
        let mut handles = Vec::new();
        for task in tasks {
            let (run_id, handle, decision) = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap();
            match decision {
                AdmissionDecision::Start => starts += 1,
                AdmissionDecision::CancelAndStart(previous) => assert_ne!(previous, run_id),
                AdmissionDecision::Queue(_) => panic!("cancel-in-progress never queues"),
            }
            handles.push((run_id, handle));
        }

        assert_eq!(starts, 1);
        let live: Vec<_> = handles.iter().filter(|(_, h)| !h.is_cancelled()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(manager.active_run("wf-123"), Some(live[0].0));
    }

    fn run_context(event: Event) -> RunContext {
        let workflow = WorkflowDefinition {
            name: "CI".to_string(),
            triggers: TriggerSet::default(),
            concurrency: None,
            env: HashMap::new(),
            jobs: vec![],
        };
        RunContext::new(Uuid::nil(), Arc::new(workflow), event, "/work")
    }

    #[test]
    fn test_render_key() {
        let run = run_context(
            Event::new("pull_request", "refs/pull/123/merge").with_head_ref("feature/login"),
        );
        assert_eq!(
            render_key("${workflow}-${ref}", &run).unwrap(),
            "CI-refs/pull/123/merge"
        );
        assert_eq!(
            render_key("${{ github.workflow }}-${{ github.head_ref || github.run_id }}", &run)
                .unwrap(),
            "CI-feature/login"
        );
        assert_eq!(render_key("deploy", &run).unwrap(), "deploy");
    }

    #[test]
    fn test_render_key_errors() {
        let run = run_context(Event::new("push", ""));
        assert!(matches!(
            render_key("${unknown}", &run),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(render_key("${ref}", &run), Err(EngineError::Config(_))));
        assert!(matches!(render_key("${ref", &run), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_queue_policy_from_str() {
        assert_eq!("fifo".parse::<QueuePolicy>().unwrap(), QueuePolicy::Fifo);
        assert_eq!(
            "supersede-pending".parse::<QueuePolicy>().unwrap(),
            QueuePolicy::SupersedePending
        );
        assert!("lifo".parse::<QueuePolicy>().is_err());
    }
}
