/*!
 * Discovery and browse results.
 *
 * Adapters that advertise [`Capability::Discover`](crate::adapter::Capability)
 * or [`Capability::Browse`](crate::adapter::Capability) return these types.
 */
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fieldmux_core::types::Value;

use crate::config::Protocol;

/// Discovery options
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// How long to listen or scan
    pub timeout: Duration,
    /// Protocol-specific hints (scan range, broker, topic filter, ...)
    pub protocol_options: HashMap<String, Value>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            protocol_options: HashMap::new(),
        }
    }
}

impl DiscoveryOptions {
    /// Set the discovery timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a protocol-specific hint
    pub fn with_option<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.protocol_options.insert(key.into(), value.into());
        self
    }
}

/// A device found by discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Protocol the device was found through
    pub protocol: Protocol,
    /// Suggested device identifier
    pub device_id: String,
    /// Human-readable name
    pub name: Option<String>,
    /// Where to reach it (host:port, endpoint URL, topic, ...)
    pub address: String,
    /// Additional protocol-specific information
    pub properties: HashMap<String, Value>,
}

/// Kind of node in a browse listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Has children, holds no value
    Folder,
    /// Readable point
    Variable,
}

/// One node of a hierarchical address listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowseNode {
    /// Address to use for read/write/subscribe
    pub address: String,
    /// Last path segment
    pub name: String,
    /// Folder or variable
    pub kind: NodeKind,
    /// Child nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BrowseNode>,
}

impl BrowseNode {
    /// Create a leaf node
    pub fn variable(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            kind: NodeKind::Variable,
            children: Vec::new(),
        }
    }

    /// Create a folder node
    pub fn folder(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            kind: NodeKind::Folder,
            children: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browse_node_serialization() {
        let mut folder = BrowseNode::folder("plant", "plant");
        folder.children.push(BrowseNode::variable("plant/temp", "temp"));

        let json = serde_json::to_value(&folder).unwrap();
        assert_eq!(json["kind"], "folder");
        assert_eq!(json["children"][0]["address"], "plant/temp");
        assert!(json["children"][0].get("children").is_none());
    }

    #[test]
    fn test_discovery_options() {
        let options = DiscoveryOptions::default()
            .with_timeout(Duration::from_secs(2))
            .with_option("topic", "#");
        assert_eq!(options.timeout, Duration::from_secs(2));
        assert_eq!(options.protocol_options["topic"], Value::from("#"));
    }
}
