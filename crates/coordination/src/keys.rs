//! Key layout inside the coordination store.

/// Namespaced key builder.
///
/// ```text
/// <prefix>:leader               leader lease, value = node id
/// <prefix>:nodes                registry hash, field = node id, value = descriptor
/// <prefix>:heartbeat:<node id>  liveness key, TTL = 2 x heartbeat interval
/// <prefix>:lock:<resource>      advisory lock, value = holder node id
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches(':').to_string();
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn leader(&self) -> String {
        format!("{}:leader", self.prefix)
    }

    pub fn registry(&self) -> String {
        format!("{}:nodes", self.prefix)
    }

    pub fn heartbeat(&self, node_id: &str) -> String {
        format!("{}:heartbeat:{node_id}", self.prefix)
    }

    pub fn lock(&self, resource_key: &str) -> String {
        format!("{}:lock:{resource_key}", self.prefix)
    }

    /// Pattern matching every lock key.
    pub fn lock_pattern(&self) -> String {
        format!("{}:lock:*", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("flowguard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let keys = KeySpace::new("wf:");
        assert_eq!(keys.leader(), "wf:leader");
        assert_eq!(keys.registry(), "wf:nodes");
        assert_eq!(keys.heartbeat("n1"), "wf:heartbeat:n1");
        assert_eq!(keys.lock("task-9"), "wf:lock:task-9");
        assert_eq!(keys.lock_pattern(), "wf:lock:*");
    }
}
