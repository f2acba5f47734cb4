//! Registry authentication through `docker login`

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{Invocation, Runner};
use crate::config::DEFAULT_CMD_TIMEOUT_SECS;
use crate::{Error, Result};

fn default_cmd_timeout() -> u64 {
    DEFAULT_CMD_TIMEOUT_SECS
}

/// Credentials for one registry
///
/// The password travels on stdin, so it never appears in the process list,
/// logs or error messages.
#[derive(Clone, Serialize, Deserialize)]
pub struct RegistryLogin {
    /// Docker Hub when unset
    #[serde(default)]
    pub server: Option<String>,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(default = "default_cmd_timeout")]
    pub cmd_timeout: u64,
}

impl std::fmt::Debug for RegistryLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryLogin")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("cmd_timeout", &self.cmd_timeout)
            .finish()
    }
}

impl RegistryLogin {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            server: None,
            username: username.into(),
            password: password.into(),
            cmd_timeout: DEFAULT_CMD_TIMEOUT_SECS,
        }
    }

    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn cmd_timeout(mut self, secs: u64) -> Self {
        self.cmd_timeout = secs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(Error::InvalidSpec("registry username cannot be empty".into()));
        }
        if self.password.is_empty() {
            return Err(Error::InvalidSpec("registry password cannot be empty".into()));
        }
        if self.cmd_timeout == 0 {
            return Err(Error::InvalidSpec("cmd_timeout must be at least 1 second".into()));
        }
        Ok(())
    }

    fn invocation(&self, binary: &str) -> Invocation {
        let mut invocation = Invocation::new(binary, Duration::from_secs(self.cmd_timeout))
            .args(["login", "--username", self.username.as_str(), "--password-stdin"]);
        if let Some(server) = &self.server {
            invocation = invocation.arg(server.as_str());
        }
        invocation.stdin(self.password.as_bytes())
    }

    /// Log in with the given docker binary
    ///
    /// A timeout surfaces as [`Error::CommandTimeout`] carrying the command
    /// line, so the caller can raise `cmd_timeout`.
    pub fn login<R: Runner + ?Sized>(&self, runner: &R, binary: &str) -> Result<()> {
        self.validate()?;
        let invocation = self.invocation(binary);

        let server = self.server.as_deref().unwrap_or("docker hub");
        tracing::info!(server, username = %self.username, "Logging in to registry");

        runner.run(&invocation)?;
        tracing::info!(server, "Registry login succeeded");
        Ok(())
    }
}
