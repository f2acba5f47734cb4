//! External program execution with timeouts
//!
//! Every collaborator that shells out (the host init adapter, registry login)
//! goes through a [`Runner`], so tests can swap in a recording implementation.

use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::CommandError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Bytes written to the child's stdin; never shown in logs or errors
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Command line as shown in logs and errors
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs
pub trait Runner: Send + Sync {
    /// Run to completion, failing on non-zero exit or timeout
    fn run(&self, invocation: &Invocation) -> Result<Output, CommandError>;
}

/// Runs programs on the local host via `std::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<Output, CommandError> {
        let command = invocation.display();
        tracing::debug!(command = %command, "Executing");

        let mut child = spawn(invocation, &command)?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        if let (Some(input), Some(mut pipe)) = (invocation.stdin.as_ref(), child.stdin.take()) {
            match pipe.write_all(input) {
                // the child quit without reading; its exit status says why
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::debug!(command = %command, "Stdin closed early");
                }
                Err(source) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CommandError::Io { command, source });
                }
                Ok(()) => {}
            }
        }

        let deadline = Instant::now() + invocation.timeout;
        let status = loop {
            let polled = child.try_wait().map_err(|source| CommandError::Io {
                command: command.clone(),
                source,
            })?;
            match polled {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::warn!(command = %command, timeout = ?invocation.timeout, "Command timed out");
                    return Err(CommandError::Timeout {
                        command,
                        timeout: invocation.timeout,
                    });
                }
                None => std::thread::sleep(POLL_INTERVAL),
            }
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if !status.success() {
            return Err(CommandError::Failed {
                command,
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(Output { stdout, stderr })
    }
}

fn spawn(invocation: &Invocation, command: &str) -> Result<Child, CommandError> {
    let stdin = if invocation.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    };

    Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            command: command.to_string(),
            source,
        })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
