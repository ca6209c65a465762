// Runners Module
// The opaque node interface contract and the dispatch seams behind it

pub mod remote;

pub use remote::{DispatchError, InProcessManager, JobSpec, JobState, JobTicket, ResourceManager};

use crate::value::Value;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Named inputs handed to an interface
pub type Inputs = BTreeMap<String, Value>;

/// Named outputs produced by an interface
pub type Outputs = BTreeMap<String, Value>;

/// Failure raised by an interface
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct InterfaceError {
    pub message: String,
}

impl InterfaceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for InterfaceError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for InterfaceError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// The computation behind a node template
#[async_trait::async_trait]
pub trait Interface: Send + Sync {
    /// Compute outputs from the resolved inputs
    async fn run(&self, inputs: &Inputs) -> Result<Outputs, InterfaceError>;
}

type InterfaceFn = dyn Fn(&Inputs) -> Result<Outputs, InterfaceError> + Send + Sync;

/// Interface backed by a plain synchronous closure
pub struct FnInterface {
    func: Box<InterfaceFn>,
}

impl FnInterface {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Inputs) -> Result<Outputs, InterfaceError> + Send + Sync + 'static,
    {
        Self {
            func: Box::new(func),
        }
    }
}

impl fmt::Debug for FnInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnInterface")
    }
}

#[async_trait::async_trait]
impl Interface for FnInterface {
    async fn run(&self, inputs: &Inputs) -> Result<Outputs, InterfaceError> {
        (self.func)(inputs)
    }
}

/// Wrap a closure as a shareable interface
pub fn interface_fn<F>(func: F) -> Arc<dyn Interface>
where
    F: Fn(&Inputs) -> Result<Outputs, InterfaceError> + Send + Sync + 'static,
{
    Arc::new(FnInterface::new(func))
}

/// Interface that forwards every input to the output of the same name
pub fn passthrough() -> Arc<dyn Interface> {
    interface_fn(|inputs| Ok(inputs.clone()))
}

/// Build a single-entry outputs map
pub fn single_output(field: impl Into<String>, value: impl Into<Value>) -> Outputs {
    let mut outputs = Outputs::new();
    outputs.insert(field.into(), value.into());
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_interface_runs_closure() {
        let double = interface_fn(|inputs| {
            let x = inputs
                .get("x")
                .and_then(Value::as_number)
                .ok_or("missing x")?;
            Ok(single_output("y", x * 2.0))
        });

        let mut inputs = Inputs::new();
        inputs.insert("x".to_string(), Value::from(21));
        let outputs = double.run(&inputs).await.unwrap();
        assert_eq!(outputs.get("y"), Some(&Value::Number(42.0)));

        let err = double.run(&Inputs::new()).await.unwrap_err();
        assert_eq!(err.message, "missing x");
    }

    #[tokio::test]
    async fn test_passthrough() {
        let mut inputs = Inputs::new();
        inputs.insert("a".to_string(), Value::from("v"));
        let outputs = passthrough().run(&inputs).await.unwrap();
        assert_eq!(outputs, inputs);
    }
}
