//! Engine client backed by the Docker Engine API
//!
//! Talks to the daemon socket through bollard. The client owns a small tokio
//! runtime and blocks on each call, so the controller stays synchronous.

use std::collections::HashMap;
use std::future::Future;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bollard::models::{
    ContainerConfig, ContainerCreateBody, ContainerInspectResponse, ContainerStateStatusEnum, HostConfig,
    PortBinding,
};
use bollard::query_parameters::{
    CommitContainerOptions, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    KillContainerOptions, ListContainersOptions, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use super::{CommitOptions, CreateOptions, EngineClient, EngineResult, StartOptions};
use crate::container::ObservedContainer;
use crate::error::EngineError;
use crate::{Error, Result};

/// Docker's own grace period for a restart
const RESTART_GRACE: Duration = Duration::from_secs(10);

/// Chunks buffered between the socket and a tar reader
const CHUNK_BACKLOG: usize = 16;

/// Socket-level ceiling; every call below carries its own bound
const CLIENT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

type Chunk = std::result::Result<Vec<u8>, bollard::errors::Error>;

/// How to reach the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Daemon socket. `DOCKER_HOST` or the platform default when unset.
    pub host: Option<String>,
    /// Upper bound for a single engine call, and for a whole export or copy
    pub timeout: Duration,
    /// Upper bound for `wait`. Unset waits as long as the container runs.
    pub wait_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: None,
            timeout: Duration::from_secs(crate::config::DEFAULT_CMD_TIMEOUT_SECS),
            wait_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    fn endpoint(&self) -> &str {
        self.host.as_deref().unwrap_or("the default socket")
    }
}

/// Docker engine reached over its API socket
pub struct DockerEngine {
    config: EngineConfig,
    docker: Docker,
    runtime: Arc<Runtime>,
}

impl DockerEngine {
    /// Connect to the local engine with default settings
    pub fn connect() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    /// Fails with a configuration error if the engine does not answer
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("engine-client")
            .enable_all()
            .build()?;

        let docker = {
            let _guard = runtime.enter();
            match &config.host {
                Some(host) => Docker::connect_with_unix(host, CLIENT_TIMEOUT.as_secs(), bollard::API_DEFAULT_VERSION),
                None => Docker::connect_with_local_defaults().map(|docker| docker.with_timeout(CLIENT_TIMEOUT)),
            }
            .map_err(|e| {
                Error::Configuration(format!("cannot open container engine at {}: {}", config.endpoint(), e))
            })?
        };

        let engine = Self {
            config,
            docker,
            runtime: Arc::new(runtime),
        };
        engine.ping()?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ping(&self) -> Result<()> {
        match self.call(self.docker.version()) {
            Ok(version) => {
                tracing::debug!(
                    version = version.version.as_deref().unwrap_or("unknown"),
                    api = version.api_version.as_deref().unwrap_or("unknown"),
                    "Container engine reachable"
                );
                Ok(())
            }
            Err(e) => Err(Error::Configuration(format!(
                "container engine unavailable at {}: {}",
                self.config.endpoint(),
                e
            ))),
        }
    }

    /// Block on `call` under the configured per-call bound
    fn call<F, T>(&self, call: F) -> EngineResult<T>
    where
        F: Future<Output = std::result::Result<T, bollard::errors::Error>>,
    {
        settle(&self.runtime, Some(self.config.timeout), call)
    }

    /// Pump a tar body into a blocking reader. The daemon reports a missing
    /// container or path on the first chunk, so that one is awaited here.
    fn tar<F, Fut>(&self, pump: F) -> EngineResult<Box<dyn Read + Send>>
    where
        F: FnOnce(mpsc::Sender<Chunk>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(CHUNK_BACKLOG);
        self.runtime.spawn(pump(sender));

        let mut stream = TarStream::new(Arc::clone(&self.runtime), receiver, self.config.timeout);
        stream.prime()?;
        Ok(Box::new(stream))
    }
}

impl EngineClient for DockerEngine {
    fn list_all(&self) -> EngineResult<Vec<String>> {
        let query = ListContainersOptions {
            all: true,
            ..Default::default()
        };
        let containers = self.call(self.docker.list_containers(Some(query)))?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    fn get(&self, id: &str) -> EngineResult<ObservedContainer> {
        let details = self.call(self.docker.inspect_container(id, None::<InspectContainerOptions>))?;
        observed(details)
    }

    fn create(&self, options: &CreateOptions) -> EngineResult<String> {
        if !options.host_config.lxc_conf.is_empty() {
            tracing::warn!(
                entries = options.host_config.lxc_conf.len(),
                "Engine API has no LXC configuration support, ignoring lxc_conf"
            );
        }

        let query = CreateContainerOptions {
            name: options.name.clone(),
            ..Default::default()
        };
        let created = self.call(self.docker.create_container(Some(query), create_body(options)))?;
        if created.id.is_empty() {
            return Err(EngineError::Malformed("create returned no container ID".into()));
        }
        Ok(created.id)
    }

    fn start(&self, id: &str, options: &StartOptions) -> EngineResult<()> {
        if options != &StartOptions::default() {
            tracing::debug!(container = %id, "Host settings were applied at create time");
        }
        not_modified(self.call(self.docker.start_container(id, None::<StartContainerOptions>)))
    }

    fn stop(&self, id: &str, timeout: Duration) -> EngineResult<()> {
        let query = StopContainerOptions {
            t: Some(i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX)),
            signal: None,
        };
        let bound = self.config.timeout + timeout;
        not_modified(settle(&self.runtime, Some(bound), self.docker.stop_container(id, Some(query))))
    }

    fn kill(&self, id: &str) -> EngineResult<()> {
        self.call(self.docker.kill_container(id, None::<KillContainerOptions>))
    }

    fn restart(&self, id: &str) -> EngineResult<()> {
        let bound = self.config.timeout + RESTART_GRACE;
        settle(
            &self.runtime,
            Some(bound),
            self.docker.restart_container(id, None::<RestartContainerOptions>),
        )
    }

    fn delete(&self, id: &str) -> EngineResult<()> {
        self.call(self.docker.remove_container(id, None::<RemoveContainerOptions>))
    }

    fn wait(&self, id: &str) -> EngineResult<i64> {
        let docker = &self.docker;
        let status = settle(&self.runtime, self.config.wait_timeout, async {
            let mut statuses = Box::pin(docker.wait_container(id, None::<WaitContainerOptions>));
            match statuses.next().await {
                Some(Ok(response)) => Ok(Some(response.status_code)),
                // non-zero exits arrive as errors carrying the code
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(Some(code)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })?;
        status.ok_or_else(|| EngineError::Malformed("wait ended without an exit status".into()))
    }

    fn commit(&self, id: &str, options: &CommitOptions) -> EngineResult<String> {
        let image = self.call(
            self.docker
                .commit_container(commit_options(id, options), ContainerConfig::default()),
        )?;
        Ok(image.id)
    }

    fn export(&self, id: &str) -> EngineResult<Box<dyn Read + Send>> {
        let docker = self.docker.clone();
        let container = id.to_string();
        self.tar(move |chunks| async move { forward(docker.export_container(&container), chunks).await })
    }

    fn copy(&self, id: &str, path: &str) -> EngineResult<Box<dyn Read + Send>> {
        let docker = self.docker.clone();
        let container = id.to_string();
        let query = DownloadFromContainerOptions { path: path.to_string() };
        self.tar(move |chunks| async move {
            forward(docker.download_from_container(&container, Some(query)), chunks).await
        })
    }
}

/// Run `call` to completion on `runtime`, giving up after `bound`
fn settle<F, T>(runtime: &Runtime, bound: Option<Duration>, call: F) -> EngineResult<T>
where
    F: Future<Output = std::result::Result<T, bollard::errors::Error>>,
{
    runtime.block_on(async {
        match bound {
            Some(bound) => match tokio::time::timeout(bound, call).await {
                Ok(result) => result.map_err(classify),
                Err(_) => Err(EngineError::Timeout(bound)),
            },
            None => call.await.map_err(classify),
        }
    })
}

async fn forward<S, B>(body: S, chunks: mpsc::Sender<Chunk>)
where
    S: Stream<Item = std::result::Result<B, bollard::errors::Error>>,
    B: AsRef<[u8]>,
{
    let mut body = Box::pin(body);
    while let Some(item) = body.next().await {
        let failed = item.is_err();
        if chunks.send(item.map(|bytes| bytes.as_ref().to_vec())).await.is_err() || failed {
            break;
        }
    }
}

fn classify(err: bollard::errors::Error) -> EngineError {
    use bollard::errors::Error as Api;

    match err {
        Api::DockerResponseServerError { status_code: 404, message } => EngineError::NotFound(message),
        Api::DockerResponseServerError { status_code: 409, message } => EngineError::Conflict(message),
        Api::DockerResponseServerError { status_code: 503, message } => EngineError::Unavailable(message),
        Api::RequestTimeoutError => EngineError::Unavailable("engine request timed out".into()),
        other => EngineError::Docker(other),
    }
}

/// Start and stop answer 304 when the container is already there
fn not_modified(result: EngineResult<()>) -> EngineResult<()> {
    match result {
        Err(EngineError::Docker(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. })) => {
            Ok(())
        }
        other => other,
    }
}

fn observed(details: ContainerInspectResponse) -> EngineResult<ObservedContainer> {
    let id = details
        .id
        .ok_or_else(|| EngineError::Malformed("inspect returned no container ID".into()))?;
    let config = details.config.unwrap_or_default();
    let state = details.state.unwrap_or_default();

    Ok(ObservedContainer {
        id,
        image_id: details.image.unwrap_or_default(),
        image_name: config.image.unwrap_or_default(),
        command: config.cmd.unwrap_or_default().join(" "),
        name: details.name.unwrap_or_default().trim_start_matches('/').to_string(),
        created: details
            .created
            .as_ref()
            .map(|created| created.to_string())
            .and_then(|created| DateTime::parse_from_rfc3339(&created).ok())
            .map(|t| t.with_timezone(&Utc)),
        running: state.running.unwrap_or(false),
        ghost: state.dead.unwrap_or(false) || state.status == Some(ContainerStateStatusEnum::DEAD),
    })
}

fn create_body(options: &CreateOptions) -> ContainerCreateBody {
    let host = &options.host_config;

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = host
        .port_bindings
        .iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .iter()
                .map(|binding| PortBinding {
                    host_ip: binding.host_ip.clone(),
                    host_port: Some(binding.host_port.clone()),
                })
                .collect();
            (port.clone(), Some(bindings))
        })
        .collect();

    ContainerCreateBody {
        hostname: options.hostname.clone(),
        user: non_empty(&options.user),
        attach_stdin: Some(options.attach_stdin),
        attach_stdout: Some(options.attach_stdout),
        attach_stderr: Some(options.attach_stderr),
        exposed_ports: some_vec(options.exposed_ports.iter().cloned().collect()),
        tty: Some(options.tty),
        open_stdin: Some(options.open_stdin),
        env: some_vec(options.env.clone()),
        cmd: options.cmd.clone(),
        entrypoint: options.entrypoint.clone().map(|entrypoint| vec![entrypoint]),
        image: Some(options.image.clone()),
        working_dir: non_empty(&options.working_dir),
        // every declared mount point comes with a bind
        host_config: Some(HostConfig {
            binds: some_vec(host.binds.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            publish_all_ports: Some(host.publish_all_ports),
            privileged: Some(host.privileged),
            dns: some_vec(options.dns.clone()),
            memory: options.memory,
            volumes_from: non_empty(&options.volumes_from).map(|from| vec![from]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn commit_options(id: &str, options: &CommitOptions) -> CommitContainerOptions {
    CommitContainerOptions {
        container: Some(id.to_string()),
        repo: options.repo.clone(),
        tag: options.tag.clone(),
        comment: options.message.clone(),
        author: options.author.clone(),
        changes: options.run.clone(),
        ..Default::default()
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn some_vec(values: Vec<String>) -> Option<Vec<String>> {
    (!values.is_empty()).then_some(values)
}

/// Tar bytes arriving from the daemon. Reads wait on the channel, never on
/// the socket, so the transfer deadline holds even when the daemon stalls.
struct TarStream {
    runtime: Arc<Runtime>,
    chunks: mpsc::Receiver<Chunk>,
    pending: Vec<u8>,
    offset: usize,
    timeout: Duration,
    deadline: Instant,
    finished: bool,
}

impl TarStream {
    fn new(runtime: Arc<Runtime>, chunks: mpsc::Receiver<Chunk>, timeout: Duration) -> Self {
        Self {
            runtime,
            chunks,
            pending: Vec::new(),
            offset: 0,
            timeout,
            deadline: Instant::now() + timeout,
            finished: false,
        }
    }

    /// `None` once the daemon has closed the body
    fn next_chunk(&mut self) -> EngineResult<Option<Vec<u8>>> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let chunks = &mut self.chunks;
        match self.runtime.block_on(tokio::time::timeout(remaining, chunks.recv())) {
            Err(_) => Err(EngineError::Timeout(self.timeout)),
            Ok(None) => Ok(None),
            Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
            Ok(Some(Err(e))) => Err(classify(e)),
        }
    }

    fn prime(&mut self) -> EngineResult<()> {
        match self.next_chunk() {
            Ok(Some(chunk)) => {
                self.pending = chunk;
                Ok(())
            }
            Ok(None) => {
                self.finished = true;
                Ok(())
            }
            Err(e) => {
                self.finish();
                Err(e)
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.chunks.close();
    }
}

impl Read for TarStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.pending.len() {
            if self.finished {
                return Ok(0);
            }
            match self.next_chunk() {
                Ok(Some(chunk)) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Ok(None) => self.finished = true,
                Err(EngineError::Timeout(timeout)) => {
                    self.finish();
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("transfer did not finish within {:?}", timeout),
                    ));
                }
                Err(e) => {
                    self.finish();
                    return Err(io::Error::other(e));
                }
            }
        }

        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
