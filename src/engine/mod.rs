//! Container engine boundary
//!
//! The controller and matcher only talk to the engine through
//! [`EngineClient`]. [`DockerEngine`] talks to the daemon's API socket;
//! [`InMemoryEngine`] keeps everything in process.

pub mod docker;
pub mod memory;
mod options;

use std::io::Read;
use std::time::Duration;

use crate::container::ObservedContainer;
use crate::error::EngineError;

pub use docker::{DockerEngine, EngineConfig};
pub use memory::InMemoryEngine;
pub use options::{CommitOptions, CreateOptions, StartOptions};

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Operations a container engine must offer, addressed by opaque IDs
#[cfg_attr(test, mockall::automock)]
pub trait EngineClient: Send + Sync {
    /// IDs of every container, stopped ones included
    fn list_all(&self) -> EngineResult<Vec<String>>;

    fn get(&self, id: &str) -> EngineResult<ObservedContainer>;

    /// Returns the new container's ID
    fn create(&self, options: &CreateOptions) -> EngineResult<String>;

    fn start(&self, id: &str, options: &StartOptions) -> EngineResult<()>;

    fn stop(&self, id: &str, timeout: Duration) -> EngineResult<()>;

    /// Immediate kill, no grace period
    fn kill(&self, id: &str) -> EngineResult<()>;

    fn restart(&self, id: &str) -> EngineResult<()>;

    fn delete(&self, id: &str) -> EngineResult<()>;

    /// Blocks until the container exits and returns its exit code
    fn wait(&self, id: &str) -> EngineResult<i64>;

    /// Returns the new image's ID
    fn commit(&self, id: &str, options: &CommitOptions) -> EngineResult<String>;

    /// Container filesystem as a tar stream
    fn export(&self, id: &str) -> EngineResult<Box<dyn Read + Send>>;

    /// `path` inside the container as a tar stream
    fn copy(&self, id: &str, path: &str) -> EngineResult<Box<dyn Read + Send>>;
}
