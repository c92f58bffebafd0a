//! Client-reported cluster health
//!
//! Clients attach their view of the cluster to every request as
//! `host1:port1(UP);host2:port2(DOWN)`, listing nodes in configured order.

use std::fmt;
use tracing::warn;

/// One node as seen by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub address: String,
    pub up: bool,
}

/// Parsed cluster health report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterHealth {
    nodes: Vec<NodeStatus>,
}

impl ClusterHealth {
    /// Parse a health string; malformed entries are skipped
    #[must_use]
    pub fn parse(report: &str) -> Self {
        let mut nodes: Vec<NodeStatus> = Vec::new();
        for entry in report.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (Some(open), Some(close)) = (entry.rfind('('), entry.rfind(')')) else {
                warn!(entry, "Invalid cluster health entry");
                continue;
            };
            if open == 0 || close <= open {
                warn!(entry, "Invalid cluster health entry");
                continue;
            }
            let address = entry[..open].trim().to_string();
            let up = entry[open + 1..close].trim().eq_ignore_ascii_case("UP");
            match nodes.iter_mut().find(|n| n.address == address) {
                Some(existing) => existing.up = up,
                None => nodes.push(NodeStatus { address, up }),
            }
        }
        Self { nodes }
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = NodeStatus>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn nodes(&self) -> &[NodeStatus] {
        &self.nodes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.up).count()
    }

    /// Position of `address` among the healthy nodes, in reported order
    #[must_use]
    pub fn healthy_rank(&self, address: &str) -> Option<usize> {
        self.nodes
            .iter()
            .filter(|n| n.up)
            .position(|n| n.address == address)
    }
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(
                f,
                "{}({})",
                node.address,
                if node.up { "UP" } else { "DOWN" }
            )?;
        }
        Ok(())
    }
}
