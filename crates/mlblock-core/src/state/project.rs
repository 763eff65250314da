//! Project model - a user workspace bound to at most one kernel.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kernel binding status of a project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl BindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for BindingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BindingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown binding status '{other}'")),
        }
    }
}

/// A project session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,

    pub name: String,

    pub kernel_id: Option<String>,

    pub kernel_url: Option<String>,

    pub kernel_status: BindingStatus,

    /// Opaque workflow graph, stored as the client sent it
    pub graph: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// A new, disconnected project with a generated name.
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        Self {
            name: generate_name(&id),
            id,
            kernel_id: None,
            kernel_url: None,
            kernel_status: BindingStatus::Disconnected,
            graph: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a kernel is bound or a binding is underway.
    pub fn has_binding(&self) -> bool {
        self.kernel_id.is_some()
            || matches!(
                self.kernel_status,
                BindingStatus::Connected | BindingStatus::Connecting
            )
    }
}

impl Default for Project {
    fn default() -> Self {
        Self::new()
    }
}

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dapper", "eager", "fuzzy", "gentle", "hidden", "icy", "jolly",
    "keen", "lucid", "mellow", "nimble", "olive", "plucky", "quiet", "rapid", "silent", "tidy",
];

const NOUNS: &[&str] = &[
    "badger", "comet", "delta", "falcon", "glacier", "harbor", "island", "lagoon", "meadow",
    "nebula", "orchid", "pebble", "quartz", "raven", "summit", "tundra", "valley", "willow",
];

/// Slug like `brisk-falcon-3fa2`, derived from the project id.
fn generate_name(id: &str) -> String {
    let bytes = id.as_bytes();
    let pick = |offset: usize, len: usize| {
        bytes
            .get(offset..offset + 4)
            .map(|chunk| chunk.iter().map(|b| *b as usize).sum::<usize>() % len)
            .unwrap_or(0)
    };
    let suffix = id.get(..4).unwrap_or(id);
    format!(
        "{}-{}-{}",
        ADJECTIVES[pick(4, ADJECTIVES.len())],
        NOUNS[pick(8, NOUNS.len())],
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_project_is_disconnected_and_named() {
        let project = Project::new();
        assert_eq!(project.kernel_status, BindingStatus::Disconnected);
        assert!(!project.has_binding());
        assert_eq!(project.name.split('-').count(), 3);
        assert!(project.name.ends_with(&project.id[..4]));
    }

    #[test]
    fn binding_detection() {
        let mut project = Project::new();
        project.kernel_status = BindingStatus::Connecting;
        assert!(project.has_binding());

        project.kernel_status = BindingStatus::Error;
        assert!(!project.has_binding());
        project.kernel_id = Some("k1".to_string());
        assert!(project.has_binding());
    }
}
