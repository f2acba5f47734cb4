//! Container Reconcile
//!
//! Desired-state reconciliation for containers on a single Docker host.
//! Declare a container, pick an action, and the controller finds the
//! matching container the engine already has and does only what is needed
//! to converge it.
//!
//! # Key Features
//!
//! - **Idempotent actions** - `run`, `start`, `stop`, `kill`, `restart`,
//!   `remove`, `redeploy`, `wait`, `commit`, `export` and `cp` are no-ops
//!   when their effect is already in place
//! - **Docker-style port and volume tokens** - `"127.0.0.1:9001:91"`,
//!   `"/data:/var/lib/app:ro"`
//! - **Service mode** - wrap the container in a systemd, upstart, sysv or
//!   runit unit
//! - **Pluggable engine** - the Docker Engine API, or an in-memory engine for tests
//!
//! # Example
//!
//! ```no_run
//! use container_reconcile::{Action, Controller, DesiredContainerSpec, DockerEngine};
//! use container_reconcile::init::{HostInitAdapter, HostInitConfig};
//!
//! let controller = Controller::new(
//!     DockerEngine::connect()?,
//!     HostInitAdapter::new(HostInitConfig::default()),
//! );
//!
//! let spec = DesiredContainerSpec::builder()
//!     .image("nginx:1.25")
//!     .name("web")
//!     .port("8080:80")
//!     .volume("/srv/www:/usr/share/nginx/html:ro")
//!     .build_validated()?;
//!
//! let outcome = controller.reconcile(Action::Run, &spec)?;
//! println!("{} is {}", spec.image, outcome.state);
//! # Ok::<(), container_reconcile::Error>(())
//! ```

pub mod command;
pub mod config;
pub mod container;
pub mod controller;
pub mod engine;
pub mod error;
pub mod init;
pub mod matcher;
pub mod ports;
pub mod registry;
pub mod volumes;

pub use config::{DesiredContainerSpec, InitSystem};
pub use container::{ContainerStatus, LifecycleState, ObservedContainer, ResolvedContainer};
pub use controller::{Action, ActionOutcome, Controller};
pub use engine::{DockerEngine, EngineClient, InMemoryEngine};
pub use error::{Error, Result};
pub use registry::RegistryLogin;
