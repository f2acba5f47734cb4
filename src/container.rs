//! Observed container records and their derived states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status derived from the engine's raw flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Orphaned record flagged by the engine
    Ghost,
    Running,
    Stopped,
}

impl ContainerStatus {
    /// Ghost wins over running, regardless of the running flag
    pub fn from_flags(running: bool, ghost: bool) -> Self {
        if ghost {
            ContainerStatus::Ghost
        } else if running {
            ContainerStatus::Running
        } else {
            ContainerStatus::Stopped
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Ghost => write!(f, "ghost"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// A container as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedContainer {
    pub id: String,
    /// Resolved image ID
    pub image_id: String,
    /// Image reference the container was created from
    pub image_name: String,
    /// Command arguments joined with single spaces
    pub command: String,
    /// Name without leading `/`
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub running: bool,
    pub ghost: bool,
}

impl ObservedContainer {
    pub fn status(&self) -> ContainerStatus {
        ContainerStatus::from_flags(self.running, self.ghost)
    }
}

/// Lifecycle state the controller reasons about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Absent,
    Stopped,
    Running,
    Ghost,
}

impl From<ContainerStatus> for LifecycleState {
    fn from(status: ContainerStatus) -> Self {
        match status {
            ContainerStatus::Ghost => LifecycleState::Ghost,
            ContainerStatus::Running => LifecycleState::Running,
            ContainerStatus::Stopped => LifecycleState::Stopped,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Absent => write!(f, "absent"),
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Ghost => write!(f, "ghost"),
        }
    }
}

/// The matcher's verdict for one declared container: the bound container, if any
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedContainer {
    pub container: Option<ObservedContainer>,
}

impl ResolvedContainer {
    pub fn absent() -> Self {
        Self { container: None }
    }

    pub fn found(container: ObservedContainer) -> Self {
        Self { container: Some(container) }
    }

    pub fn id(&self) -> Option<&str> {
        self.container.as_ref().map(|c| c.id.as_str())
    }

    pub fn status(&self) -> Option<ContainerStatus> {
        self.container.as_ref().map(ObservedContainer::status)
    }

    pub fn state(&self) -> LifecycleState {
        self.status().map_or(LifecycleState::Absent, LifecycleState::from)
    }

    pub fn exists(&self) -> bool {
        self.state() != LifecycleState::Absent
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }
}
