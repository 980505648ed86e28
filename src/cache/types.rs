use serde::Deserialize;
use std::fmt;

/// Whether a cache coordinates with sibling nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Single node: no update notifications, no handoff.
    Standalone,
    #[default]
    NetworkNode,
}

/// Simple payloads stay put; mobile payloads follow an entity between nodes.
/// A singleton cache holds one value under a fixed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheKind {
    #[default]
    Simple,
    Mobile,
    Singleton,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
