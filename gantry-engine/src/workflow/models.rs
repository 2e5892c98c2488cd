use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

/// A GitHub Actions-style workflow document as written on disk.
///
/// This is the raw shape of the YAML. `WorkflowParser::compile` validates it
/// and turns it into a `WorkflowDefinition`.
#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    /// The name of the workflow
    pub name: Option<String>,

    /// The trigger configuration for the workflow
    #[serde(rename = "on")]
    pub on: Trigger,

    /// Workflow-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Default settings for all jobs in the workflow
    #[serde(default)]
    pub defaults: Option<Defaults>,

    /// Concurrency group and cancellation policy
    #[serde(default)]
    pub concurrency: Option<Concurrency>,

    /// The jobs that make up this workflow, in declaration order
    #[serde(deserialize_with = "ordered_map")]
    pub jobs: Vec<(String, Job)>,
}

/// Trigger configuration for when the workflow should run.
///
/// Supports multiple trigger formats:
/// - Simple: `on: push`
/// - List: `on: [push, pull_request]`
/// - Detailed: `on: { pull_request: { types: [opened] } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    /// Single event trigger: `on: push`
    Single(String),

    /// Multiple events: `on: [push, pull_request]`
    Multiple(Vec<String>),

    /// Detailed event configuration
    Detailed(HashMap<String, Option<EventConfig>>),
}

/// Configuration for a specific trigger event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventConfig {
    /// Event sub-types (`opened`, `synchronize`, ...)
    #[serde(default)]
    pub types: Vec<String>,

    /// Branch filters for push/pull_request events
    #[serde(default)]
    pub branches: Vec<String>,

    /// Branch ignore patterns
    #[serde(default, rename = "branches-ignore")]
    pub branches_ignore: Vec<String>,
}

/// Default settings for jobs and steps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Defaults {
    /// Default settings for run steps
    #[serde(default)]
    pub run: Option<RunDefaults>,
}

/// Default settings for run steps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunDefaults {
    /// Default shell to use
    #[serde(default)]
    pub shell: Option<String>,

    /// Default working directory
    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,
}

/// Concurrency settings to limit workflow runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Concurrency {
    /// Simple concurrency group name
    Simple(String),

    /// Detailed concurrency configuration
    Detailed {
        group: String,
        #[serde(default, rename = "cancel-in-progress")]
        cancel_in_progress: bool,
    },
}

impl Concurrency {
    pub fn group(&self) -> &str {
        match self {
            Concurrency::Simple(group) => group,
            Concurrency::Detailed { group, .. } => group,
        }
    }

    pub fn cancel_in_progress(&self) -> bool {
        match self {
            Concurrency::Simple(_) => false,
            Concurrency::Detailed {
                cancel_in_progress, ..
            } => *cancel_in_progress,
        }
    }
}

/// A job within a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    /// Display name for the job
    #[serde(default)]
    pub name: Option<String>,

    /// Job-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Default settings for steps in this job
    #[serde(default)]
    pub defaults: Option<Defaults>,

    /// Matrix strategy for running multiple job instances
    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// The steps that make up this job
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Strategy configuration for matrix builds.
#[derive(Debug, Clone, Deserialize)]
pub struct Strategy {
    /// Matrix configuration
    #[serde(default)]
    pub matrix: Option<Matrix>,

    /// Whether to cancel all instances if one fails
    #[serde(default = "default_fail_fast", rename = "fail-fast")]
    pub fail_fast: bool,

    /// Maximum number of instances to run in parallel
    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<usize>,
}

fn default_fail_fast() -> bool {
    true
}

/// Matrix configuration for parallel job execution.
///
/// Every key other than `include` and `exclude` is a dimension. Dimensions
/// keep their declared order.
#[derive(Debug, Clone, Default)]
pub struct Matrix {
    /// Matrix dimensions in declaration order
    pub dimensions: Vec<(String, Vec<Value>)>,

    /// Additional matrix combinations to include
    pub include: Vec<MatrixEntry>,

    /// Matrix combinations to exclude
    pub exclude: Vec<MatrixEntry>,
}

/// One `include` or `exclude` entry, keys in declared order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixEntry(pub Vec<(String, Value)>);

impl MatrixEntry {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for MatrixEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = MatrixEntry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of matrix keys to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<MatrixEntry, A::Error> {
                let mut entries: Vec<(String, Value)> = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    match entries.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, existing)) => *existing = value,
                        None => entries.push((key, value)),
                    }
                }
                Ok(MatrixEntry(entries))
            }
        }

        deserializer.deserialize_map(EntryVisitor)
    }
}

impl<'de> Deserialize<'de> for Matrix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MatrixVisitor;

        impl<'de> Visitor<'de> for MatrixVisitor {
            type Value = Matrix;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a matrix mapping of dimension names to value lists")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Matrix, A::Error> {
                let mut matrix = Matrix::default();

                while let Some(key) = access.next_key::<String>()? {
                    match key.as_str() {
                        "include" => matrix.include = access.next_value()?,
                        "exclude" => matrix.exclude = access.next_value()?,
                        _ => {
                            let values: Vec<Value> = access.next_value().map_err(|_| {
                                de::Error::custom(format!(
                                    "matrix dimension '{}' must be a list of values",
                                    key
                                ))
                            })?;
                            matrix.dimensions.push((key, values));
                        }
                    }
                }

                Ok(matrix)
            }
        }

        deserializer.deserialize_map(MatrixVisitor)
    }
}

/// A step within a job or a composite action.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Step {
    /// Unique identifier for the step (used in outputs)
    #[serde(default)]
    pub id: Option<String>,

    /// Display name for the step
    #[serde(default)]
    pub name: Option<String>,

    /// Conditional expression for step execution
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Shell command to run
    #[serde(default)]
    pub run: Option<String>,

    /// Shell to use for the run command
    #[serde(default)]
    pub shell: Option<String>,

    /// Working directory for the step
    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,

    /// Action to use (e.g., "actions/checkout@v4")
    #[serde(default)]
    pub uses: Option<String>,

    /// Inputs to pass to the action
    #[serde(default)]
    pub with: HashMap<String, Value>,

    /// Step-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Whether to continue job if this step fails
    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: bool,
}

impl Step {
    /// Get a display name for the step.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            name.clone()
        } else if let Some(uses) = &self.uses {
            format!("Run {}", uses)
        } else if let Some(run) = &self.run {
            // Truncate long commands
            let first_line = run.lines().next().unwrap_or(run);
            if first_line.chars().count() > 50 {
                format!("Run {}...", first_line.chars().take(47).collect::<String>())
            } else {
                format!("Run {}", first_line)
            }
        } else {
            "Unnamed step".to_string()
        }
    }
}

/// Deserialize a YAML mapping into a `Vec` that keeps the document order.
pub(crate) fn ordered_map<'de, D, V>(deserializer: D) -> Result<Vec<(String, V)>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct OrderedVisitor<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
        type Value = Vec<(String, V)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::new();
            while let Some((key, value)) = access.next_entry::<String, V>()? {
                if entries.iter().any(|(k, _): &(String, V)| *k == key) {
                    return Err(de::Error::custom(format!("duplicate key '{}'", key)));
                }
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedVisitor(PhantomData))
}
