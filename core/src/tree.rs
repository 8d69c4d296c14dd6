use crate::types::encode_canonical;
use crate::{Id, Result};
use serde::{Deserialize, Serialize};

/// One directory entry.
///
/// Directories point at their child tree by ID, never by an in-memory link,
/// so the whole directory graph stays a set of independent, content-addressed
/// values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    File {
        name: String,
        mode: u32,
        size: u64,
        content: Vec<Id>,
    },
    Dir {
        name: String,
        mode: u32,
        subtree: Id,
    },
}

impl Node {
    pub fn file(name: impl Into<String>, mode: u32, size: u64, content: Vec<Id>) -> Self {
        Node::File {
            name: name.into(),
            mode,
            size,
            content,
        }
    }

    pub fn dir(name: impl Into<String>, mode: u32, subtree: Id) -> Self {
        Node::Dir {
            name: name.into(),
            mode,
            subtree,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::File { name, .. } | Node::Dir { name, .. } => name,
        }
    }

    pub fn mode(&self) -> u32 {
        match self {
            Node::File { mode, .. } | Node::Dir { mode, .. } => *mode,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Node::File { .. })
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir { .. })
    }

    pub fn subtree(&self) -> Option<Id> {
        match self {
            Node::Dir { subtree, .. } => Some(*subtree),
            Node::File { .. } => None,
        }
    }

    pub fn content(&self) -> &[Id] {
        match self {
            Node::File { content, .. } => content,
            Node::Dir { .. } => &[],
        }
    }
}

/// One directory level. Node order is significant: it is part of the
/// serialized form and therefore of the tree ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        encode_canonical(self)
    }

    pub fn id(&self) -> Result<Id> {
        Ok(Id::hash(&self.canonical_bytes()?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    pub fn total_size(&self) -> u64 {
        self.nodes
            .iter()
            .map(|node| match node {
                Node::File { size, .. } => *size,
                Node::Dir { .. } => 0,
            })
            .sum()
    }

    pub fn file_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_file()).count()
    }

    pub fn dir_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_dir()).count()
    }
}
