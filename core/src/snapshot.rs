use crate::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Assigned by the store once the snapshot has been written.
    #[serde(skip)]
    pub id: Option<Id>,
    pub time: DateTime<Utc>,
    pub tree: Id,
    pub paths: Vec<PathBuf>,
    pub hostname: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Id>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Snapshot {
    pub fn new(paths: Vec<PathBuf>, time: DateTime<Utc>, tree: Id) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            id: None,
            time,
            tree,
            paths,
            hostname,
            username,
            parent: None,
            tags: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: Id) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn short_id(&self) -> String {
        self.id
            .map(|id| id.short_string())
            .unwrap_or_else(|| "unsaved".to_string())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} - {} paths on {} at {}",
            self.short_id(),
            self.paths.len(),
            self.hostname,
            self.time.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}
