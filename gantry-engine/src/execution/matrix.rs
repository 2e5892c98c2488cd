// Matrix Strategy Expansion
// Expands matrix strategies into concrete job instances

use crate::expression::value_to_string;
use crate::workflow::definition::JobDefinition;
use crate::workflow::models::{Matrix, MatrixEntry};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// One combination of matrix values, in declared dimension order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixAssignment(Vec<(String, Value)>);

impl MatrixAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Set a value, keeping the position of an existing key
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether every entry of `filter` is present with an equal value
    pub fn matches(&self, filter: &MatrixEntry) -> bool {
        filter.iter().all(|(k, v)| self.get(k) == Some(v))
    }

    /// `matrix` context for expressions
    pub fn to_context(&self) -> Map<String, Value> {
        self.0.iter().cloned().collect()
    }
}

impl fmt::Display for MatrixAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self.0.iter().map(|(_, v)| value_to_string(v)).collect();
        write!(f, "{}", values.join(", "))
    }
}

impl Serialize for MatrixAssignment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for MatrixAssignment {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut assignment = MatrixAssignment::new();
        for (k, v) in iter {
            assignment.insert(k, v);
        }
        assignment
    }
}

/// A single instance of a job (one matrix combination)
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// Position in the expanded job list
    pub index: usize,
    pub job_id: String,
    pub matrix: MatrixAssignment,
}

impl JobInstance {
    /// Display name: `build (ubuntu-22.04, stable)`
    pub fn display_name(&self, job_name: &str) -> String {
        if self.matrix.is_empty() {
            job_name.to_string()
        } else {
            format!("{} ({})", job_name, self.matrix)
        }
    }
}

/// The expanded instances of one job, with its fail-fast policy
#[derive(Debug, Clone)]
pub struct JobMatrix {
    pub job_id: String,
    pub fail_fast: bool,
    pub max_parallel: Option<usize>,
    pub instances: Vec<JobInstance>,
}

/// Matrix expander for job strategies
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a job into its instances, numbering them from `first_index`
    pub fn expand(job: &JobDefinition, first_index: usize) -> JobMatrix {
        let instances = Self::expand_matrix(&job.matrix)
            .into_iter()
            .enumerate()
            .map(|(i, matrix)| JobInstance {
                index: first_index + i,
                job_id: job.id.clone(),
                matrix,
            })
            .collect();

        JobMatrix {
            job_id: job.id.clone(),
            fail_fast: job.fail_fast,
            max_parallel: job.max_parallel,
            instances,
        }
    }

    /// Expand a matrix into its combinations.
    ///
    /// The cross product follows declared dimension order and declared value
    /// order with the last dimension varying fastest. `exclude` entries then
    /// remove matching combinations and `include` entries extend or append.
    /// A matrix with nothing declared yields a single empty combination.
    pub fn expand_matrix(matrix: &Matrix) -> Vec<MatrixAssignment> {
        if matrix.dimensions.is_empty() && matrix.include.is_empty() {
            return vec![MatrixAssignment::new()];
        }

        let mut combinations = if matrix.dimensions.is_empty() {
            Vec::new()
        } else {
            Self::cross_product(&matrix.dimensions)
        };

        combinations.retain(|combo| !matrix.exclude.iter().any(|ex| combo.matches(ex)));

        Self::apply_includes(combinations, matrix)
    }

    fn cross_product(dimensions: &[(String, Vec<Value>)]) -> Vec<MatrixAssignment> {
        let mut combinations = vec![MatrixAssignment::new()];

        for (name, values) in dimensions {
            let mut next = Vec::with_capacity(combinations.len() * values.len());
            for combo in &combinations {
                for value in values {
                    let mut extended = combo.clone();
                    extended.insert(name.as_str(), value.clone());
                    next.push(extended);
                }
            }
            combinations = next;
        }

        combinations
    }

    /// An include entry is merged into every combination whose original
    /// dimension values it does not overwrite; otherwise it becomes a new
    /// combination of its own.
    fn apply_includes(
        mut combinations: Vec<MatrixAssignment>,
        matrix: &Matrix,
    ) -> Vec<MatrixAssignment> {
        let original = combinations.len();
        let is_dimension = |key: &str| matrix.dimensions.iter().any(|(name, _)| name == key);

        for entry in &matrix.include {
            let mut merged = false;

            for combo in combinations.iter_mut().take(original) {
                let compatible = entry
                    .iter()
                    .filter(|(k, _)| is_dimension(*k))
                    .all(|(k, v)| combo.get(k) == Some(v));

                if compatible {
                    for (k, v) in entry.iter() {
                        if !is_dimension(k) {
                            combo.insert(k, v.clone());
                        }
                    }
                    merged = true;
                }
            }

            if !merged {
                combinations.push(entry.iter().map(|(k, v)| (k, v.clone())).collect());
            }
        }

        combinations
    }
}
