// Execution Records
// Per execution node JSON records keyed by (template, branch), used to resume runs

use crate::execution::identity::NodeKey;
use crate::runners::{Inputs, Outputs};

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur with the record store
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed record at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No default record directory on this platform")]
    NoDefaultDir,
}

/// Stored outcome of one succeeded execution node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub workflow: String,
    pub node: NodeKey,
    pub inputs: Inputs,
    pub outputs: Outputs,
    /// Seconds since the Unix epoch
    pub recorded_at: u64,
}

impl NodeRecord {
    pub fn new(
        workflow: impl Into<String>,
        node: NodeKey,
        inputs: Inputs,
        outputs: Outputs,
    ) -> Self {
        let recorded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            workflow: workflow.into(),
            node,
            inputs,
            outputs,
            recorded_at,
        }
    }
}

/// Directory of node records
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Store under the platform cache directory (e.g. ~/.cache/iterflow/runs)
    pub fn with_default_dir() -> Result<Self, RecordError> {
        let root = dirs::cache_dir()
            .ok_or(RecordError::NoDefaultDir)?
            .join("iterflow")
            .join("runs");
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working directory of one execution node
    pub fn node_dir(&self, workflow: &str, node: &NodeKey) -> PathBuf {
        self.root
            .join(workflow)
            .join(&node.template)
            .join(node.branch.slug())
    }

    pub fn record_path(&self, workflow: &str, node: &NodeKey) -> PathBuf {
        self.node_dir(workflow, node).join("record.json")
    }

    pub fn save(&self, record: &NodeRecord) -> Result<PathBuf, RecordError> {
        let dir = self.node_dir(&record.workflow, &record.node);
        fs::create_dir_all(&dir).map_err(|source| RecordError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join("record.json");
        let json = serde_json::to_string_pretty(record).map_err(|source| RecordError::Malformed {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| RecordError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(node = %record.node, path = %path.display(), "record saved");
        Ok(path)
    }

    /// Load a record, `None` when the node was never recorded
    pub fn load(&self, workflow: &str, node: &NodeKey) -> Result<Option<NodeRecord>, RecordError> {
        let path = self.record_path(workflow, node);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(RecordError::Io { path, source }),
        };
        let record = serde_json::from_str(&content)
            .map_err(|source| RecordError::Malformed { path, source })?;
        Ok(Some(record))
    }

    /// Remove every record of a workflow
    pub fn clear(&self, workflow: &str) -> Result<(), RecordError> {
        let dir = self.root.join(workflow);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RecordError::Io { path: dir, source }),
        }
    }
}
