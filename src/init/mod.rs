//! Host service supervisor integration
//!
//! When a declaration names an init system, the container is wrapped in a host
//! service unit and start/stop/restart go through the supervisor instead of
//! the engine.

pub mod host;
pub mod unit;

use std::collections::BTreeMap;

use crate::config::{DesiredContainerSpec, InitSystem};
use crate::Result;

pub use host::{HostInitAdapter, HostInitConfig};

/// Supervisor verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
}

impl std::fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceAction::Start => write!(f, "start"),
            ServiceAction::Stop => write!(f, "stop"),
            ServiceAction::Restart => write!(f, "restart"),
            ServiceAction::Enable => write!(f, "enable"),
            ServiceAction::Disable => write!(f, "disable"),
        }
    }
}

/// A service unit wrapping one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnit {
    pub name: String,
    pub init: InitSystem,
    /// Built-in template name or path to a template file
    pub template: String,
    pub variables: BTreeMap<String, String>,
}

impl ServiceUnit {
    /// `None` when the declaration has no init system
    pub fn from_spec(spec: &DesiredContainerSpec) -> Option<Self> {
        let template = match &spec.init_system {
            InitSystem::None => return None,
            InitSystem::Systemd { template, .. } => template.clone().unwrap_or_else(|| unit::SYSTEMD_SERVICE.into()),
            InitSystem::Upstart { template } => template.clone().unwrap_or_else(|| unit::UPSTART_CONF.into()),
            InitSystem::Sysv { template } => template.clone().unwrap_or_else(|| unit::SYSV_SCRIPT.into()),
            InitSystem::Runit { template } => template.clone().unwrap_or_else(|| unit::RUNIT_RUN.into()),
        };

        let name = spec.service_name();
        let mut variables = BTreeMap::new();
        variables.insert("service_name".to_string(), name.clone());
        variables.insert("cmd_timeout".to_string(), spec.cmd_timeout.to_string());
        variables.insert("cidfile".to_string(), spec.cidfile().unwrap_or_default());
        variables.insert("sockets".to_string(), sockets(spec));

        Some(Self {
            name,
            init: spec.init_system.clone(),
            template,
            variables,
        })
    }

    pub fn variable(&self, key: &str) -> &str {
        self.variables.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Container ports of every declaration, space separated
fn sockets(spec: &DesiredContainerSpec) -> String {
    spec.port_map()
        .map(|ports| {
            ports
                .container_ports()
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// Manages host service units
#[cfg_attr(test, mockall::automock)]
pub trait InitSystemAdapter: Send + Sync {
    /// Install the unit for the service
    fn create(&self, unit: &ServiceUnit) -> Result<()>;

    fn action(&self, unit: &ServiceUnit, action: ServiceAction) -> Result<()>;

    /// Take the unit out of service and uninstall it
    fn remove(&self, unit: &ServiceUnit) -> Result<()>;
}
