//! Desired container declaration with builder pattern

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ports::{PortMap, PortToken};
use crate::volumes::VolumeSet;

/// Default timeout for engine and init-system commands, in seconds
pub const DEFAULT_CMD_TIMEOUT_SECS: u64 = 60;

/// The container the caller wants to exist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredContainerSpec {
    pub image: String,
    pub command: Option<String>,
    pub container_name: Option<String>,
    pub ports: Vec<PortToken>,
    pub volumes: Vec<String>,
    pub env: Vec<String>,
    pub dns: Vec<String>,
    pub entrypoint: Option<String>,
    pub hostname: Option<String>,
    /// Memory limit in bytes
    pub memory: Option<i64>,
    pub user: Option<String>,
    pub working_directory: Option<String>,
    pub stdin: bool,
    pub tty: bool,
    pub detach: bool,
    pub publish_exposed_ports: bool,
    pub privileged: bool,
    pub volumes_from: Option<String>,
    /// Secondary-namespace (LXC) configuration entries
    pub lxc_conf: Vec<String>,
    pub init_system: InitSystem,
    pub cidfile: Option<String>,
    /// Seconds
    pub cmd_timeout: u64,
    pub commit: CommitSettings,
    /// Path inside the container copied out by `cp`
    pub source: Option<String>,
    /// Host file written by `cp` and `export`
    pub destination: Option<PathBuf>,
}

/// Host service supervisor wrapping the container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InitSystem {
    #[default]
    None,
    Systemd {
        #[serde(default)]
        template: Option<String>,
        #[serde(default)]
        socket_template: Option<String>,
    },
    Upstart {
        #[serde(default)]
        template: Option<String>,
    },
    Sysv {
        #[serde(default)]
        template: Option<String>,
    },
    Runit {
        #[serde(default)]
        template: Option<String>,
    },
}

impl InitSystem {
    pub fn is_configured(&self) -> bool {
        !matches!(self, InitSystem::None)
    }
}

impl std::fmt::Display for InitSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitSystem::None => write!(f, "none"),
            InitSystem::Systemd { .. } => write!(f, "systemd"),
            InitSystem::Upstart { .. } => write!(f, "upstart"),
            InitSystem::Sysv { .. } => write!(f, "sysv"),
            InitSystem::Runit { .. } => write!(f, "runit"),
        }
    }
}

/// Metadata recorded when snapshotting a container to an image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitSettings {
    pub author: Option<String>,
    pub tag: Option<String>,
    pub repo: Option<String>,
    pub message: Option<String>,
    /// Dockerfile instruction applied to the new image, e.g. `CMD ["app"]`
    pub run: Option<String>,
}

impl Default for DesiredContainerSpec {
    fn default() -> Self {
        Self {
            image: String::new(),
            command: None,
            container_name: None,
            ports: Vec::new(),
            volumes: Vec::new(),
            env: Vec::new(),
            dns: Vec::new(),
            entrypoint: None,
            hostname: None,
            memory: None,
            user: None,
            working_directory: None,
            stdin: false,
            tty: false,
            detach: true,
            publish_exposed_ports: false,
            privileged: false,
            volumes_from: None,
            lxc_conf: Vec::new(),
            init_system: InitSystem::None,
            cidfile: None,
            cmd_timeout: DEFAULT_CMD_TIMEOUT_SECS,
            commit: CommitSettings::default(),
            source: None,
            destination: None,
        }
    }
}

impl DesiredContainerSpec {
    pub fn builder() -> DesiredContainerSpecBuilder {
        DesiredContainerSpecBuilder::default()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.image.trim().is_empty() {
            return Err(crate::Error::InvalidSpec("image cannot be empty".into()));
        }
        if matches!(&self.container_name, Some(name) if name.is_empty()) {
            return Err(crate::Error::InvalidSpec("container_name cannot be empty when set".into()));
        }
        if matches!(&self.command, Some(cmd) if cmd.trim().is_empty()) {
            return Err(crate::Error::InvalidSpec("command cannot be blank when set".into()));
        }
        if self.cmd_timeout == 0 {
            return Err(crate::Error::InvalidSpec("cmd_timeout must be at least 1 second".into()));
        }
        self.port_map()?;
        self.volume_set()?;
        Ok(())
    }

    pub fn port_map(&self) -> crate::Result<PortMap> {
        PortMap::parse(&self.ports)
    }

    pub fn volume_set(&self) -> crate::Result<VolumeSet> {
        VolumeSet::parse(&self.volumes)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.cmd_timeout)
    }

    /// Declared name, or in service mode the image's last path segment
    /// without tag or digest
    pub fn effective_name(&self) -> Option<String> {
        match (&self.container_name, self.init_system.is_configured()) {
            (Some(name), _) => Some(name.clone()),
            (None, true) => Some(image_basename(&self.image).to_string()),
            (None, false) => None,
        }
    }

    /// Host service unit name; only meaningful when an init system is set
    pub fn service_name(&self) -> String {
        self.effective_name()
            .unwrap_or_else(|| image_basename(&self.image).to_string())
    }

    pub fn cidfile(&self) -> Option<String> {
        match (&self.cidfile, self.init_system.is_configured()) {
            (Some(path), _) => Some(path.clone()),
            (None, true) => Some(format!("/var/run/{}.cid", self.service_name())),
            (None, false) => None,
        }
    }
}

fn image_basename(image: &str) -> &str {
    let last = image.rsplit('/').next().unwrap_or(image);
    let last = last.split('@').next().unwrap_or(last);
    last.split(':').next().unwrap_or(last)
}

#[derive(Default)]
pub struct DesiredContainerSpecBuilder {
    spec: DesiredContainerSpec,
}

impl DesiredContainerSpecBuilder {
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.spec.image = image.into();
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.spec.command = Some(command.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec.container_name = Some(name.into());
        self
    }

    pub fn port(mut self, port: impl Into<PortToken>) -> Self {
        self.spec.ports.push(port.into());
        self
    }

    pub fn volume(mut self, volume: impl Into<String>) -> Self {
        self.spec.volumes.push(volume.into());
        self
    }

    pub fn env(mut self, var: impl Into<String>) -> Self {
        self.spec.env.push(var.into());
        self
    }

    pub fn dns(mut self, server: impl Into<String>) -> Self {
        self.spec.dns.push(server.into());
        self
    }

    pub fn entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.spec.entrypoint = Some(entrypoint.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.spec.hostname = Some(hostname.into());
        self
    }

    pub fn memory(mut self, bytes: i64) -> Self {
        self.spec.memory = Some(bytes);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.spec.user = Some(user.into());
        self
    }

    pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
        self.spec.working_directory = Some(dir.into());
        self
    }

    pub fn stdin(mut self, enabled: bool) -> Self {
        self.spec.stdin = enabled;
        self
    }

    pub fn tty(mut self, enabled: bool) -> Self {
        self.spec.tty = enabled;
        self
    }

    pub fn detach(mut self, enabled: bool) -> Self {
        self.spec.detach = enabled;
        self
    }

    pub fn publish_exposed_ports(mut self, enabled: bool) -> Self {
        self.spec.publish_exposed_ports = enabled;
        self
    }

    pub fn privileged(mut self, enabled: bool) -> Self {
        self.spec.privileged = enabled;
        self
    }

    pub fn volumes_from(mut self, container: impl Into<String>) -> Self {
        self.spec.volumes_from = Some(container.into());
        self
    }

    pub fn lxc_conf(mut self, entry: impl Into<String>) -> Self {
        self.spec.lxc_conf.push(entry.into());
        self
    }

    pub fn init_system(mut self, init: InitSystem) -> Self {
        self.spec.init_system = init;
        self
    }

    pub fn cidfile(mut self, path: impl Into<String>) -> Self {
        self.spec.cidfile = Some(path.into());
        self
    }

    pub fn cmd_timeout(mut self, secs: u64) -> Self {
        self.spec.cmd_timeout = secs;
        self
    }

    pub fn commit(mut self, settings: CommitSettings) -> Self {
        self.spec.commit = settings;
        self
    }

    pub fn source(mut self, path: impl Into<String>) -> Self {
        self.spec.source = Some(path.into());
        self
    }

    pub fn destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.destination = Some(path.into());
        self
    }

    pub fn build(self) -> DesiredContainerSpec {
        self.spec
    }

    pub fn build_validated(self) -> crate::Result<DesiredContainerSpec> {
        let spec = self.build();
        spec.validate()?;
        Ok(spec)
    }
}
