// Node Templates
// Immutable definitions of computational units plus their iterable and join declarations

use crate::runners::Interface;
use crate::value::Value;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Declared arity of an input field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arity {
    /// Receives exactly one value
    Scalar,
    /// Receives an ordered collection, one value per joined branch
    Join,
}

/// A named input field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputField {
    pub name: String,
    pub arity: Arity,
}

/// How several iterable fields on one splitter combine into a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationPolicy {
    /// Branch `i` takes the `i`-th value of every field; lengths must match
    #[default]
    Zip,
    /// Cartesian product, flattened row-major over declared field order
    Product,
}

/// Iterable declaration attached to a splitter
#[derive(Debug, Clone, PartialEq)]
pub struct IterableSpec {
    /// Fields in declaration order, each with its value sequence
    pub fields: Vec<(String, Vec<Value>)>,
    pub policy: IterationPolicy,
}

impl IterableSpec {
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn is_iterable(&self, field: &str) -> bool {
        self.fields.iter().any(|(name, _)| name == field)
    }
}

/// What a join does when one of its contributing branches fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Any failed slot fails the join; it never executes
    #[default]
    FailFast,
    /// Failed slots are omitted from the assembled collections
    IgnoreFailures,
}

/// Join declaration attached to a join node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSpec {
    /// Splitter template whose expansion this node collects
    pub joinsource: String,
    pub joinfields: Vec<String>,
    pub failure_policy: FailurePolicy,
}

impl JoinSpec {
    pub fn is_joinfield(&self, field: &str) -> bool {
        self.joinfields.iter().any(|f| f == field)
    }
}

/// Immutable definition of a computational unit
#[derive(Clone)]
pub struct NodeTemplate {
    pub name: String,
    pub inputs: Vec<InputField>,
    pub outputs: Vec<String>,
    pub interface: Arc<dyn Interface>,
    /// Values for inputs that no edge feeds
    pub defaults: BTreeMap<String, Value>,
    /// Dispatch timeout overriding the engine default
    pub timeout: Option<Duration>,
    pub iterables: Option<IterableSpec>,
    pub join: Option<JoinSpec>,
}

impl NodeTemplate {
    pub fn new(name: impl Into<String>, interface: Arc<dyn Interface>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            interface,
            defaults: BTreeMap::new(),
            timeout: None,
            iterables: None,
            join: None,
        }
    }

    /// Declare a scalar input field
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputField {
            name: name.into(),
            arity: Arity::Scalar,
        });
        self
    }

    /// Declare a join-collecting input field
    pub fn join_input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputField {
            name: name.into(),
            arity: Arity::Join,
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn with_default(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.defaults.insert(field.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn input_field(&self, name: &str) -> Option<&InputField> {
        self.inputs.iter().find(|f| f.name == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o == name)
    }

    pub fn is_splitter(&self) -> bool {
        self.iterables.is_some()
    }

    pub fn is_join(&self) -> bool {
        self.join.is_some()
    }

    /// Whether the named input collects one value per joined branch
    pub fn is_joinfield(&self, field: &str) -> bool {
        self.join.as_ref().is_some_and(|j| j.is_joinfield(field))
    }
}

impl fmt::Debug for NodeTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTemplate")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("defaults", &self.defaults)
            .field("timeout", &self.timeout)
            .field("iterables", &self.iterables)
            .field("join", &self.join)
            .finish()
    }
}
