//! Child process seam for the supervisor

use crate::logging::LogFormat;
use crate::{AgentError, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Subcommand the supervisor runs in the child
pub const CHILD_SUBCOMMAND: &str = "service-run-no-restarts";

/// How a supervised child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    /// Terminated by a signal, with its number when known
    Signaled(Option<i32>),
    /// The child could not be started
    SpawnFailed,
}

impl ChildExit {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Code(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<std::process::ExitStatus> for ChildExit {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self::Signaled(status.signal())
        }
        #[cfg(not(unix))]
        {
            Self::Signaled(None)
        }
    }
}

/// Starts a fresh child process
#[async_trait]
pub trait ChildLauncher: Send + Sync {
    async fn spawn(&self) -> Result<Box<dyn SupervisedChild>>;
}

/// A running child
#[async_trait]
pub trait SupervisedChild: Send {
    fn pid(&self) -> Option<u32>;

    async fn wait(&mut self) -> Result<ChildExit>;

    /// Ask the child to finish its current cycle and exit
    fn request_stop(&mut self) -> Result<()>;
}

/// Re-executes the current binary in no-restart service mode
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    /// Launch `current_exe service-run-no-restarts --root <root> --log-format json`
    pub fn current_exe(root: &Path) -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, root))
    }

    pub fn new(program: impl Into<PathBuf>, root: &Path) -> Self {
        Self {
            program: program.into(),
            args: vec![
                OsString::from("--root"),
                root.as_os_str().to_os_string(),
                OsString::from("--log-format"),
                OsString::from(LogFormat::Json.as_str()),
                OsString::from(CHILD_SUBCOMMAND),
            ],
        }
    }

    /// Append an argument after the subcommand
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

#[async_trait]
impl ChildLauncher for ProcessLauncher {
    async fn spawn(&self) -> Result<Box<dyn SupervisedChild>> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                AgentError::Other(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;
        tracing::info!(pid = ?child.id(), "Started service child");
        Ok(Box::new(ProcessChild { child }))
    }
}

struct ProcessChild {
    child: Child,
}

#[async_trait]
impl SupervisedChild for ProcessChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ChildExit> {
        Ok(self.child.wait().await?.into())
    }

    #[cfg(unix)]
    fn request_stop(&mut self) -> Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        if unsafe { libc::kill(pid as i32, libc::SIGTERM) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn request_stop(&mut self) -> Result<()> {
        Ok(self.child.start_kill()?)
    }
}
