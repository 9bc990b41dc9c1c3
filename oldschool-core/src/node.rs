use serde::{Deserialize, Serialize};

/// A node of the store's hierarchical key space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Absent on the wire for the namespace root.
    #[serde(default = "root_key")]
    pub key: String,
    #[serde(default)]
    pub dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub modified_index: u64,
    #[serde(default)]
    pub created_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

fn root_key() -> String {
    "/".to_string()
}

impl Node {
    pub fn file(key: impl Into<String>, value: impl Into<String>, index: u64) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            modified_index: index,
            created_index: index,
            ..Self::default()
        }
    }

    pub fn directory(key: impl Into<String>, nodes: Vec<Node>, index: u64) -> Self {
        Self {
            key: key.into(),
            dir: true,
            nodes,
            modified_index: index,
            created_index: index,
            ..Self::default()
        }
    }

    /// Final path segment, empty for the root.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or_default()
    }
}

/// Mutation kind carried by an [`Event`].
///
/// The store distinguishes more actions on the wire than the mirror cares about; conditional
/// and create/update writes fold into `Set`, expirations into `Delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Action {
    #[serde(rename = "get")]
    Get,
    #[serde(
        rename = "set",
        alias = "create",
        alias = "update",
        alias = "compareAndSwap"
    )]
    Set,
    #[serde(rename = "delete", alias = "expire", alias = "compareAndDelete")]
    Delete,
}

/// One response from the store: a `get` result or a single change on the feed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub action: Action,
    pub node: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_node: Option<Node>,
    /// Store index at the time the response was produced (`X-Etcd-Index`).
    #[serde(skip)]
    pub etcd_index: u64,
    #[serde(skip)]
    pub raft_index: u64,
    #[serde(skip)]
    pub raft_term: u64,
}

impl Event {
    pub fn new(action: Action, node: Node) -> Self {
        Self {
            action,
            node,
            prev_node: None,
            etcd_index: 0,
            raft_index: 0,
            raft_term: 0,
        }
    }

    pub fn modified_index(&self) -> u64 {
        self.node.modified_index
    }
}
