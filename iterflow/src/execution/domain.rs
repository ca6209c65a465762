// Iteration Domains
// Turns a splitter's iterable declaration into an ordered list of branch assignments

use crate::graph::error::GraphError;
use crate::graph::template::{IterableSpec, IterationPolicy};
use crate::value::Value;

/// The ordered set of branches a splitter expands into
#[derive(Debug, Clone, PartialEq)]
pub struct IterationDomain {
    /// Fields in declaration order, each with its value sequence
    fields: Vec<(String, Vec<Value>)>,
    policy: IterationPolicy,
    size: usize,
}

impl IterationDomain {
    /// Compute the domain for a splitter
    pub fn from_spec(splitter: &str, spec: &IterableSpec) -> Result<Self, GraphError> {
        if spec.fields.is_empty() {
            return Err(GraphError::iterable_arity(format!(
                "splitter '{}' declares no iterable fields",
                splitter
            )));
        }

        for (field, values) in &spec.fields {
            if values.is_empty() {
                return Err(GraphError::iterable_arity(format!(
                    "iterable field '{}' on '{}' has no values",
                    field, splitter
                )));
            }
        }

        let size = match spec.policy {
            IterationPolicy::Zip => {
                let expected = spec.fields[0].1.len();
                if let Some((field, values)) =
                    spec.fields.iter().find(|(_, v)| v.len() != expected)
                {
                    return Err(GraphError::iterable_arity(format!(
                        "zip on '{}' needs equal lengths: '{}' has {} values, '{}' has {}",
                        splitter,
                        spec.fields[0].0,
                        expected,
                        field,
                        values.len()
                    )));
                }
                expected
            }
            IterationPolicy::Product => spec.fields.iter().map(|(_, v)| v.len()).product(),
        };

        Ok(Self {
            fields: spec.fields.clone(),
            policy: spec.policy,
            size,
        })
    }

    /// Number of branches
    pub fn size(&self) -> usize {
        self.size
    }

    /// Per-field indices for a branch ordinal
    ///
    /// Under `Product` the ordinal is decoded row-major: the last declared field varies fastest.
    pub fn indices(&self, ordinal: usize) -> Option<Vec<usize>> {
        if ordinal >= self.size {
            return None;
        }

        match self.policy {
            IterationPolicy::Zip => Some(vec![ordinal; self.fields.len()]),
            IterationPolicy::Product => {
                let mut remaining = ordinal;
                let mut indices = vec![0; self.fields.len()];
                for (slot, (_, values)) in indices.iter_mut().zip(&self.fields).rev() {
                    *slot = remaining % values.len();
                    remaining /= values.len();
                }
                Some(indices)
            }
        }
    }

    /// Field values assigned to a branch ordinal, in declared field order
    pub fn assignment(&self, ordinal: usize) -> Option<Vec<(String, Value)>> {
        let indices = self.indices(ordinal)?;
        Some(
            self.fields
                .iter()
                .zip(indices)
                .map(|((field, values), idx)| (field.clone(), values[idx].clone()))
                .collect(),
        )
    }
}
