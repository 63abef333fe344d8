//! ---
//! vfab_section: "05-edge-interfaces"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Collaborator contracts and in-memory backends."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{NetError, Result};

/// Raw process-variable transport exposed by a device controller.
///
/// Nodes are addressed as `{device_node_prefix}/{field}`. Reads and writes
/// may fail transiently; callers are expected to fall back to documented
/// defaults rather than abort their cycle.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Read the current value of a named node.
    async fn read_node(&self, node: &str) -> Result<Value>;

    /// Write a value to a named node.
    async fn write_node(&self, node: &str, value: Value) -> Result<()>;

    /// Invoke a method node on an object node, returning its result if any.
    async fn call_method(&self, object_node: &str, method_node: &str) -> Result<Option<Value>>;
}

/// Map-backed telemetry source for unit tests.
///
/// Individual nodes can be marked as failing to exercise fallback paths;
/// method invocations are recorded for assertion.
#[derive(Debug, Default)]
pub struct InMemoryTelemetry {
    nodes: Mutex<HashMap<String, Value>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl InMemoryTelemetry {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a node value directly.
    pub fn set_node(&self, node: impl Into<String>, value: Value) {
        self.nodes.lock().insert(node.into(), value);
    }

    /// Mark a node so reads and writes against it fail transiently.
    pub fn fail_node(&self, node: impl Into<String>) {
        self.failing.lock().insert(node.into());
    }

    /// Clear a previously injected node failure.
    pub fn heal_node(&self, node: &str) {
        self.failing.lock().remove(node);
    }

    /// Snapshot of `(object_node, method_node)` invocations.
    pub fn method_calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    /// Current value of a node, if present.
    pub fn node(&self, node: &str) -> Option<Value> {
        self.nodes.lock().get(node).cloned()
    }

    fn check_failure(&self, node: &str) -> Result<()> {
        if self.failing.lock().contains(node) {
            return Err(NetError::Transient(format!("injected failure on {node}")));
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetrySource for InMemoryTelemetry {
    async fn read_node(&self, node: &str) -> Result<Value> {
        self.check_failure(node)?;
        self.nodes
            .lock()
            .get(node)
            .cloned()
            .ok_or_else(|| NetError::UnknownNode(node.to_owned()))
    }

    async fn write_node(&self, node: &str, value: Value) -> Result<()> {
        self.check_failure(node)?;
        self.nodes.lock().insert(node.to_owned(), value);
        Ok(())
    }

    async fn call_method(&self, object_node: &str, method_node: &str) -> Result<Option<Value>> {
        self.calls
            .lock()
            .push((object_node.to_owned(), method_node.to_owned()));
        Ok(None)
    }
}
