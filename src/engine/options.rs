//! Structured option records for engine calls

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::{CommitSettings, DesiredContainerSpec};
use crate::ports::{PortBinding, PortMap};
use crate::volumes::VolumeSet;

/// Host-side settings applied when a container starts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartOptions {
    pub binds: Vec<String>,
    pub lxc_conf: Vec<String>,
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    pub publish_all_ports: bool,
    pub privileged: bool,
}

impl StartOptions {
    pub fn from_spec(spec: &DesiredContainerSpec, ports: &PortMap) -> Self {
        Self {
            binds: spec.volumes.clone(),
            lxc_conf: spec.lxc_conf.clone(),
            port_bindings: ports.published.clone(),
            publish_all_ports: spec.publish_exposed_ports,
            privileged: spec.privileged,
        }
    }
}

/// Everything needed to create a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateOptions {
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub cmd: Option<Vec<String>>,
    pub dns: Vec<String>,
    pub env: Vec<String>,
    pub exposed_ports: BTreeSet<String>,
    pub entrypoint: Option<String>,
    pub hostname: Option<String>,
    pub image: String,
    pub memory: Option<i64>,
    pub name: Option<String>,
    pub open_stdin: bool,
    pub tty: bool,
    pub user: String,
    pub volumes: BTreeSet<String>,
    pub volumes_from: String,
    pub working_dir: String,
    /// Engines that fix host settings at creation read them from here
    pub host_config: StartOptions,
}

impl CreateOptions {
    pub fn from_spec(spec: &DesiredContainerSpec, ports: &PortMap, volumes: &VolumeSet) -> Self {
        let attach = !spec.detach;

        Self {
            attach_stdin: attach,
            attach_stdout: attach,
            attach_stderr: attach,
            cmd: spec
                .command
                .as_deref()
                .map(|cmd| cmd.split_whitespace().map(str::to_string).collect()),
            dns: spec.dns.clone(),
            env: spec.env.clone(),
            exposed_ports: ports.exposed.clone(),
            entrypoint: spec.entrypoint.clone(),
            hostname: spec.hostname.clone(),
            image: spec.image.clone(),
            memory: spec.memory,
            name: spec.effective_name(),
            open_stdin: spec.stdin,
            tty: spec.tty,
            user: spec.user.clone().unwrap_or_default(),
            volumes: volumes.exposed.clone(),
            volumes_from: spec.volumes_from.clone().unwrap_or_default(),
            working_dir: spec.working_directory.clone().unwrap_or_default(),
            host_config: StartOptions::from_spec(spec, ports),
        }
    }
}

/// Image metadata for a commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOptions {
    pub author: Option<String>,
    pub tag: Option<String>,
    pub repo: Option<String>,
    pub message: Option<String>,
    pub run: Option<String>,
}

impl From<&CommitSettings> for CommitOptions {
    fn from(settings: &CommitSettings) -> Self {
        Self {
            author: settings.author.clone(),
            tag: settings.tag.clone(),
            repo: settings.repo.clone(),
            message: settings.message.clone(),
            run: settings.run.clone(),
        }
    }
}

impl CommitOptions {
    /// `repo[:tag]`, if a repository was given
    pub fn reference(&self) -> Option<String> {
        self.repo.as_ref().map(|repo| match &self.tag {
            Some(tag) => format!("{}:{}", repo, tag),
            None => repo.clone(),
        })
    }
}
