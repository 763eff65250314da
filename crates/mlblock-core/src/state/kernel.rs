//! Kernel resource model - one record per provisioned worker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapters::ContainerHandle;

/// Lifecycle status of a kernel resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    #[default]
    Starting,
    Running,
    Stopped,
    Error,
}

impl KernelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// STOPPED and ERROR are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Allowed moves: STARTING -> RUNNING, and any live status to
    /// STOPPED or ERROR.
    pub fn can_transition_to(&self, next: KernelStatus) -> bool {
        match (self, next) {
            (Self::Starting, Self::Running) => true,
            (Self::Starting | Self::Running, Self::Stopped | Self::Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown kernel status '{other}'")),
        }
    }
}

/// A provisioned kernel and the worker container backing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelResource {
    pub id: String,

    /// Runtime handle, attached once the launch succeeded
    pub container_id: Option<String>,

    pub container_image: String,

    pub status: KernelStatus,

    /// Reachable worker address; only set while RUNNING
    pub url: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl KernelResource {
    /// A fresh STARTING record with no worker attached.
    pub fn new(container_image: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            container_id: None,
            container_image: container_image.into(),
            status: KernelStatus::Starting,
            url: None,
            created_at: Utc::now(),
        }
    }

    pub fn handle(&self) -> Option<ContainerHandle> {
        self.container_id.as_deref().map(ContainerHandle::new)
    }
}
