//! Node descriptors and their wire encoding.
//!
//! Descriptors are published into the shared registry hash as versioned JSON
//! (`{"v":1,...}`). Readers reject versions they do not know and ignore
//! unknown fields, so new optional fields can be added without a flag day.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowguard_core::NodeId;

/// Current descriptor encoding version.
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Role of a node inside the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Follower,
    Leader,
    /// Finishing in-flight work; takes no new leases, locks or assignments.
    Draining,
}

/// Raw load inputs; converted into a normalized score.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LoadSample {
    pub active_connections: u32,
    pub max_connections: u32,
    /// Optional CPU utilisation in [0, 1].
    pub cpu: Option<f64>,
    /// Optional memory utilisation in [0, 1].
    pub memory: Option<f64>,
}

impl LoadSample {
    pub fn connections(active: u32, max: u32) -> Self {
        Self {
            active_connections: active,
            max_connections: max,
            ..Self::default()
        }
    }

    /// Saturation of the busiest resource, clamped to [0, 1].
    pub fn score(&self) -> f64 {
        let connection_ratio = if self.max_connections == 0 {
            0.0
        } else {
            f64::from(self.active_connections) / f64::from(self.max_connections)
        };

        [Some(connection_ratio), self.cpu, self.memory]
            .into_iter()
            .flatten()
            .filter(|v| v.is_finite())
            .fold(0.0_f64, f64::max)
            .clamp(0.0, 1.0)
    }
}

/// Published view of one cluster node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    /// Normalized saturation in [0, 1].
    pub load_score: f64,
    pub processed_task_count: u64,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl NodeDescriptor {
    pub fn new(node_id: NodeId, host: impl Into<String>, port: u16, now: DateTime<Utc>) -> Self {
        Self {
            node_id,
            host: host.into(),
            port,
            status: NodeStatus::Follower,
            load_score: 0.0,
            processed_task_count: 0,
            started_at: now,
            last_heartbeat_at: now,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.status == NodeStatus::Draining
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported descriptor version: {0}")]
    UnsupportedVersion(u64),

    #[error("malformed descriptor: {0}")]
    Malformed(String),
}

#[derive(Serialize)]
struct EncodedRef<'a> {
    v: u32,
    #[serde(flatten)]
    node: &'a NodeDescriptor,
}

/// Encode a descriptor for the registry hash.
pub fn encode(node: &NodeDescriptor) -> Result<String, CodecError> {
    serde_json::to_string(&EncodedRef {
        v: DESCRIPTOR_VERSION,
        node,
    })
    .map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Decode a registry value, checking the version tag first.
pub fn decode(raw: &str) -> Result<NodeDescriptor, CodecError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let version = value
        .get("v")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| CodecError::Malformed("missing version tag".to_string()))?;

    if version != u64::from(DESCRIPTOR_VERSION) {
        return Err(CodecError::UnsupportedVersion(version));
    }

    serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NodeDescriptor {
        let mut node = NodeDescriptor::new(NodeId::generate("10.0.0.5", 9000), "10.0.0.5", 9000, Utc::now());
        node.load_score = 0.25;
        node.processed_task_count = 7;
        node
    }

    #[test]
    fn encoded_descriptor_carries_version_tag() {
        let node = sample();
        let raw = encode(&node).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["status"], "follower");
        assert_eq!(decode(&raw).unwrap(), node);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let node = sample();
        let mut value = serde_json::to_value(&node).unwrap();
        value["v"] = serde_json::json!(1);
        value["region"] = serde_json::json!("eu-west-1");
        let decoded = decode(&value.to_string()).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn unknown_versions_and_legacy_strings_are_rejected() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["v"] = serde_json::json!(2);
        assert!(matches!(
            decode(&value.to_string()),
            Err(CodecError::UnsupportedVersion(2))
        ));

        assert!(matches!(
            decode("node-1|10.0.0.5|9000|FOLLOWER|0.2"),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn load_score_takes_busiest_resource() {
        assert_eq!(LoadSample::connections(25, 100).score(), 0.25);
        assert_eq!(LoadSample::connections(5, 0).score(), 0.0);
        assert_eq!(LoadSample::connections(500, 100).score(), 1.0);

        let sample = LoadSample {
            cpu: Some(0.9),
            ..LoadSample::connections(10, 100)
        };
        assert_eq!(sample.score(), 0.9);
    }
}
