// Trigger Evaluator
// Decides whether an incoming event starts a run of a workflow

use crate::error::{EngineError, EngineResult};
use crate::workflow::definition::{TriggerRule, TriggerSet};

use serde::Serialize;

/// An incoming event. Produced externally and never mutated.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Event {
    /// Event kind, e.g. `push` or `pull_request`
    pub kind: String,
    /// Activity type, e.g. `opened` or `synchronize`
    pub subtype: Option<String>,
    /// Branch or ref the event refers to
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub head_ref: Option<String>,
    pub base_ref: Option<String>,
    pub sha: Option<String>,
    pub actor: Option<String>,
}

impl Event {
    pub fn new(kind: impl Into<String>, git_ref: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            git_ref: git_ref.into(),
            ..Default::default()
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_head_ref(mut self, head_ref: impl Into<String>) -> Self {
        self.head_ref = Some(head_ref.into());
        self
    }

    pub fn with_base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = Some(base_ref.into());
        self
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Branch used by branch filters. Pull request events filter on their
    /// target branch.
    pub fn filter_branch(&self) -> &str {
        let branch = if self.kind.starts_with("pull_request") {
            self.base_ref.as_deref().unwrap_or(&self.git_ref)
        } else {
            &self.git_ref
        };
        strip_branch_prefix(branch)
    }
}

fn strip_branch_prefix(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

/// Trigger evaluator
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    /// Whether `event` should start a run of a workflow with `triggers`.
    ///
    /// Fails when the trigger set is empty or has a rule without a kind.
    pub fn accepts(event: &Event, triggers: &TriggerSet) -> EngineResult<bool> {
        Self::check(triggers)?;

        Ok(triggers
            .rules
            .iter()
            .filter(|rule| rule.kind == event.kind)
            .any(|rule| Self::rule_accepts(rule, event)))
    }

    fn check(triggers: &TriggerSet) -> EngineResult<()> {
        if triggers.rules.is_empty() {
            return Err(EngineError::config("workflow has no triggers"));
        }
        if triggers.rules.iter().any(|rule| rule.kind.trim().is_empty()) {
            return Err(EngineError::config("trigger with an empty event kind"));
        }
        Ok(())
    }

    fn rule_accepts(rule: &TriggerRule, event: &Event) -> bool {
        if !rule.subtypes.is_empty() {
            match &event.subtype {
                Some(subtype) if rule.subtypes.iter().any(|s| s == subtype) => {}
                _ => return false,
            }
        }

        let branch = event.filter_branch();
        if !rule.branches.is_empty() && !filter_matches(&rule.branches, branch) {
            return false;
        }
        if !rule.branches_ignore.is_empty() && filter_matches(&rule.branches_ignore, branch) {
            return false;
        }

        true
    }
}

/// Evaluate a filter list in order. Later patterns override earlier ones and a
/// leading `!` negates a pattern.
fn filter_matches(patterns: &[String], branch: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        match pattern.strip_prefix('!') {
            Some(negated) => {
                if glob_match(negated, branch) {
                    matched = false;
                }
            }
            None => {
                if glob_match(pattern, branch) {
                    matched = true;
                }
            }
        }
    }
    matched
}

/// Match a branch name against a pattern where `*` matches within one path
/// segment, `**` matches across segments and `?` matches one character.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_at(&pattern, &text)
}

fn glob_match_at(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            let double = pattern.get(1) == Some(&'*');
            let rest = if double { &pattern[2..] } else { &pattern[1..] };
            for skip in 0..=text.len() {
                if !double && text[..skip].contains(&'/') {
                    break;
                }
                if glob_match_at(rest, &text[skip..]) {
                    return true;
                }
            }
            false
        }
        Some('?') => !text.is_empty() && text[0] != '/' && glob_match_at(&pattern[1..], &text[1..]),
        Some(c) => text.first() == Some(c) && glob_match_at(&pattern[1..], &text[1..]),
    }
}
