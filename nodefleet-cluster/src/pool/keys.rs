//! Store key layout

/// Builds every key under one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn all_nodes(&self) -> String {
        format!("{}:nodes:all", self.prefix)
    }

    #[must_use]
    pub fn active_nodes(&self) -> String {
        format!("{}:nodes:active", self.prefix)
    }

    #[must_use]
    pub fn frozen_nodes(&self) -> String {
        format!("{}:nodes:frozen", self.prefix)
    }

    #[must_use]
    pub fn heartbeat(&self, node_id: &str) -> String {
        format!("{}:node:{node_id}:heartbeat", self.prefix)
    }

    #[must_use]
    pub fn status(&self, node_id: &str) -> String {
        format!("{}:node:{node_id}:status", self.prefix)
    }

    #[must_use]
    pub fn commands(&self, node_id: &str) -> String {
        format!("{}:node:{node_id}:commands", self.prefix)
    }

    #[must_use]
    pub fn processing(&self, node_id: &str) -> String {
        format!("{}:node:{node_id}:processing", self.prefix)
    }

    #[must_use]
    pub fn node_ips(&self) -> String {
        format!("{}:node_ips", self.prefix)
    }

    #[must_use]
    pub fn command_result(&self, command_id: &str) -> String {
        format!("{}:command:{command_id}:result", self.prefix)
    }

    #[must_use]
    pub fn channel(&self, name: &str) -> String {
        format!("{}:{name}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("nodefleet");
        assert_eq!(keys.all_nodes(), "nodefleet:nodes:all");
        assert_eq!(keys.heartbeat("n1"), "nodefleet:node:n1:heartbeat");
        assert_eq!(keys.command_result("abc"), "nodefleet:command:abc:result");
        assert_eq!(keys.channel("lb_events"), "nodefleet:lb_events");
    }
}
