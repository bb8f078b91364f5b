//! Child process session
//!
//! Manages a single line-driven child with its stdin and stdout attached to
//! pipes. Handles the full lifecycle: spawn, byte transport, and teardown.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipe::{self, ReadMode, TransportError, LINE_TERMINATOR};

/// Shutdown sequence sent by [`Session::close`] unless configured otherwise.
///
/// The leading newline clears any half-typed command left on the child's
/// input line.
pub const DEFAULT_QUIT_COMMAND: &str = "\nquit\n";

/// Errors that can occur during session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Failed to wait for child: {0}")]
    WaitFailed(#[source] io::Error),

    #[error("Child exited abnormally: {0}")]
    AbnormalExit(ExitStatus),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Configuration for spawning a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Executable name or path, resolved through `PATH`
    pub command: String,
    /// Arguments passed after the executable
    pub args: Vec<String>,
    /// Working directory for the child (inherits ours when unset)
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Bytes written to the child during teardown
    pub quit_command: String,
    /// Also put the child's stdin pipe into non-blocking mode
    pub nonblocking_input: bool,
}

impl SessionConfig {
    /// Create a config for `command` with no arguments
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            quit_command: DEFAULT_QUIT_COMMAND.to_string(),
            nonblocking_input: false,
        }
    }

    /// Set the argument list
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace the shutdown sequence
    pub fn with_quit_command(mut self, quit: impl Into<String>) -> Self {
        self.quit_command = quit.into();
        self
    }

    /// Toggle non-blocking mode on the child's stdin pipe
    pub fn with_nonblocking_input(mut self, nonblocking: bool) -> Self {
        self.nonblocking_input = nonblocking;
        self
    }
}

/// A live child process and the two pipe ends that talk to it
///
/// The session owns the child and both descriptors exclusively. There is no
/// cleanup on drop: callers must finish with [`Session::close`], otherwise the
/// child is never reaped. Not meant for concurrent use; callers sharing a
/// session across threads serialize access themselves.
#[must_use = "a session must be finished with `close` to reap the child"]
pub struct Session {
    /// Unique identifier for this session
    id: Uuid,
    /// The child process
    child: Child,
    /// Child's stdout, non-blocking
    reader: ChildStdout,
    /// Child's stdin
    writer: ChildStdin,
    /// Shutdown sequence
    quit_command: String,
}

impl Session {
    /// Spawn `command` with `args` using the default configuration
    pub fn spawn<I, S>(command: &str, args: I) -> SessionResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::spawn_with(SessionConfig::new(command).with_args(args))
    }

    /// Spawn a child per `config` and wire its stdin/stdout to pipes
    ///
    /// Either returns a fully initialized session or leaves nothing behind: a
    /// child that was started but could not be configured is killed and reaped
    /// and its pipes are closed before the error is returned.
    pub fn spawn_with(config: SessionConfig) -> SessionResult<Self> {
        if config.command.is_empty() {
            return Err(SessionError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }

        let id = Uuid::new_v4();

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| SessionError::SpawnFailed {
            command: config.command.clone(),
            source,
        })?;

        let (reader, writer) = match Self::attach_pipes(&mut child, config.nonblocking_input) {
            Ok(pipes) => pipes,
            Err(source) => {
                warn!(
                    session_id = %id,
                    pid = child.id(),
                    "Pipe setup failed, killing child: {}",
                    source
                );
                Self::kill_and_reap(&mut child, id);
                return Err(SessionError::SpawnFailed {
                    command: config.command,
                    source,
                });
            }
        };

        info!(
            session_id = %id,
            pid = child.id(),
            "Spawned {} {:?}",
            config.command,
            config.args
        );

        Ok(Self {
            id,
            child,
            reader,
            writer,
            quit_command: config.quit_command,
        })
    }

    /// Take the pipe ends from a fresh child and set their modes.
    ///
    /// On error, any pipe already taken is dropped (closed) here.
    fn attach_pipes(
        child: &mut Child,
        nonblocking_input: bool,
    ) -> io::Result<(ChildStdout, ChildStdin)> {
        let writer = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin was not captured"))?;
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout was not captured"))?;

        pipe::set_nonblocking(&reader)?;
        if nonblocking_input {
            pipe::set_nonblocking(&writer)?;
        }

        Ok((reader, writer))
    }

    /// Roll back a half-initialized spawn
    fn kill_and_reap(child: &mut Child, id: Uuid) {
        if let Err(e) = child.kill() {
            warn!(session_id = %id, pid = child.id(), "Failed to kill child: {}", e);
        }
        if let Err(e) = child.wait() {
            warn!(session_id = %id, pid = child.id(), "Failed to reap child: {}", e);
        }
    }

    /// Get the session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the child's OS process ID
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Write all of `buf` to the child's stdin
    ///
    /// Returns `buf.len()` on success. On failure the error carries how many
    /// bytes made it across first.
    pub fn write_all(&mut self, buf: &[u8]) -> SessionResult<usize> {
        let written = pipe::write_all(&mut self.writer, buf)?;
        debug!(session_id = %self.id, written, "Wrote to child");
        Ok(written)
    }

    /// Write a string to the child's stdin
    pub fn write_str(&mut self, s: &str) -> SessionResult<usize> {
        self.write_all(s.as_bytes())
    }

    /// Read up to `buf.len()` bytes from the child's stdout
    ///
    /// Stops at the first read that ends in a newline, when the buffer fills,
    /// or at end-of-stream (which yields `Ok(0)` if nothing was read). Waits
    /// without timeout while the child has produced nothing, so only call
    /// this when output is known to be on its way; see [`Session::try_read`].
    pub fn read(&mut self, buf: &mut [u8]) -> SessionResult<usize> {
        let n = pipe::read_some(&mut self.reader, buf, ReadMode::Wait)?;
        debug!(session_id = %self.id, read = n, "Read from child");
        Ok(n)
    }

    /// Like [`Session::read`], but returns what has accumulated instead of
    /// waiting. `Ok(0)` means nothing is available right now.
    pub fn try_read(&mut self, buf: &mut [u8]) -> SessionResult<usize> {
        Ok(pipe::read_some(&mut self.reader, buf, ReadMode::NoWait)?)
    }

    /// Read until a chunk from the child ends in a newline
    ///
    /// Returns the bytes up to and including the newline that ends a read.
    /// Lines the child wrote together arrive together, so the result can hold
    /// several lines. It ends without a newline only if the child closed its
    /// stdout first; an empty vector means end-of-stream.
    pub fn read_line(&mut self) -> SessionResult<Vec<u8>> {
        let mut line = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            line.extend_from_slice(&chunk[..n]);
            if line.last() == Some(&LINE_TERMINATOR) {
                break;
            }
        }

        Ok(line)
    }

    /// Send the quit sequence, wait for the child to exit, release the pipes
    ///
    /// The wait is attempted even when the quit sequence could not be
    /// delivered. Stdin is closed right after the quit write, before the wait,
    /// so children that stop on EOF also exit; stdout is closed once the wait
    /// completes. Both pipes are closed by the time this returns, whatever
    /// the outcome. The first failure is reported; a child killed by a signal
    /// is [`SessionError::AbnormalExit`].
    pub fn close(self) -> SessionResult<()> {
        let Session {
            id,
            mut child,
            reader,
            mut writer,
            quit_command,
        } = self;

        info!(session_id = %id, pid = child.id(), "Closing session");

        let delivered = pipe::write_all(&mut writer, quit_command.as_bytes());
        drop(writer);

        let waited = child.wait();
        drop(reader);

        if let Err(e) = delivered {
            warn!(session_id = %id, "Quit command not delivered: {}", e);
            return Err(e.into());
        }

        let status = waited.map_err(SessionError::WaitFailed)?;
        if status.code().is_none() {
            warn!(session_id = %id, "Child terminated abnormally: {}", status);
            return Err(SessionError::AbnormalExit(status));
        }

        info!(session_id = %id, "Child exited: {}", status);
        Ok(())
    }
}
