//! Node discovery
//!
//! Resolves the set of nodes to probe. The set is re-resolved at the start of
//! every poll cycle, so a dynamic implementation can add or remove nodes
//! between cycles.

use async_trait::async_trait;

use crate::config::AggregatorConfig;

/// A node to poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Identifier recorded with the node's readings
    pub source: String,

    /// Full URL of the node's status endpoint
    pub status_url: String,
}

impl Node {
    pub fn new(source: impl Into<String>, status_url: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            status_url: status_url.into(),
        }
    }
}

#[async_trait]
pub trait NodeDiscovery: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<Node>>;
}

/// Fixed node list taken from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    nodes: Vec<Node>,
}

impl StaticDiscovery {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn from_config(config: &AggregatorConfig) -> Self {
        let nodes = config
            .nodes
            .iter()
            .map(|node| {
                let base = node.address.trim_end_matches('/');
                let base = if base.contains("://") {
                    base.to_string()
                } else {
                    format!("http://{base}")
                };

                Node {
                    source: node.name.clone().unwrap_or_else(|| node.address.clone()),
                    status_url: format!("{base}{}", config.status_path),
                }
            })
            .collect();

        Self { nodes }
    }
}

#[async_trait]
impl NodeDiscovery for StaticDiscovery {
    async fn discover(&self) -> anyhow::Result<Vec<Node>> {
        Ok(self.nodes.clone())
    }
}
