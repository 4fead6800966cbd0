//! Process supervisor
//!
//! `service-run` keeps a child `service-run-no-restarts` process alive. The
//! child does the work; the supervisor only watches exit codes and forwards
//! stop requests, so a corrupted child never takes the supervisor with it.
//!
//! ```text
//! Starting -> Running -> Stopped   exit 0 or stop request, supervisor exits 0
//!                     -> Fatal     exit 78 or a configured code, exit code propagated
//!                     -> Crashed   anything else, back to Starting after backoff
//! ```

mod backoff;
mod child;

pub use backoff::Backoff;
pub use child::{ChildExit, ChildLauncher, ProcessLauncher, SupervisedChild, CHILD_SUBCOMMAND};

use crate::config::SupervisorSettings;
use crate::signals::stopped;
use crate::{metrics, EXIT_CODE_FATAL};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How the supervisor reads a child exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Stopped,
    Crashed,
    Fatal,
}

/// Maps child exits to [`ExitKind`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitPolicy {
    fatal_codes: Vec<i32>,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            fatal_codes: vec![EXIT_CODE_FATAL],
        }
    }
}

impl ExitPolicy {
    pub fn new(extra_fatal_codes: &[i32]) -> Self {
        let mut policy = Self::default();
        for code in extra_fatal_codes {
            if !policy.fatal_codes.contains(code) {
                policy.fatal_codes.push(*code);
            }
        }
        policy
    }

    pub fn classify(&self, exit: ChildExit) -> ExitKind {
        match exit {
            ChildExit::Code(0) => ExitKind::Stopped,
            ChildExit::Code(code) if self.fatal_codes.contains(&code) => ExitKind::Fatal,
            _ => ExitKind::Crashed,
        }
    }
}

/// Observable supervisor bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorState {
    pub last_exit_code: Option<i32>,

    /// Children started after a crash
    pub restart_count: u32,

    /// Crashes since the last healthy run
    pub consecutive_crashes: u32,

    /// Set while waiting to restart
    pub backoff_until: Option<Instant>,
}

/// Why the supervisor returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    Stopped,
    Fatal(i32),
}

impl SupervisorOutcome {
    /// Exit code for the supervisor process
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Stopped => 0,
            Self::Fatal(code) => *code,
        }
    }
}

enum Event {
    Exited(ChildExit),
    StopRequested,
}

pub struct Supervisor {
    launcher: Arc<dyn ChildLauncher>,
    policy: ExitPolicy,
    backoff: Backoff,
    healthy_after: Duration,
    state: SupervisorState,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn ChildLauncher>, settings: &SupervisorSettings) -> Self {
        Self {
            launcher,
            policy: ExitPolicy::new(&settings.fatal_exit_codes),
            backoff: Backoff::from_settings(settings),
            healthy_after: Duration::from_secs(settings.healthy_after_secs),
            state: SupervisorState::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// A child running at least this long resets the crash counter
    pub fn with_healthy_after(mut self, healthy_after: Duration) -> Self {
        self.healthy_after = healthy_after;
        self
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    /// Supervise until a child stops cleanly, a fatal exit, or `stop` turns true
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> SupervisorOutcome {
        loop {
            if *stop.borrow() {
                return SupervisorOutcome::Stopped;
            }

            let started = Instant::now();
            let exit = match self.launcher.spawn().await {
                Ok(child) => match self.watch_child(child, &mut stop).await {
                    Some(exit) => exit,
                    None => return SupervisorOutcome::Stopped,
                },
                Err(e) => {
                    error!(error = %e, "Failed to start service child");
                    ChildExit::SpawnFailed
                }
            };

            self.state.last_exit_code = exit.code();
            match self.policy.classify(exit) {
                ExitKind::Stopped => {
                    info!("Service child exited cleanly");
                    return SupervisorOutcome::Stopped;
                }
                ExitKind::Fatal => {
                    let code = exit.code().unwrap_or(EXIT_CODE_FATAL);
                    error!(exit_code = code, "Service child hit a fatal condition, not restarting");
                    return SupervisorOutcome::Fatal(code);
                }
                ExitKind::Crashed => {}
            }

            if started.elapsed() >= self.healthy_after {
                self.state.consecutive_crashes = 0;
            }
            self.state.consecutive_crashes += 1;

            let delay = self.backoff.delay(self.state.consecutive_crashes);
            let until = Instant::now() + delay;
            self.state.backoff_until = Some(until);
            warn!(
                exit = ?exit,
                consecutive_crashes = self.state.consecutive_crashes,
                backoff_secs = delay.as_secs_f64(),
                "Service child crashed, restarting after backoff"
            );

            let stop_requested = tokio::select! {
                _ = tokio::time::sleep_until(until) => false,
                _ = stopped(&mut stop) => true,
            };
            self.state.backoff_until = None;
            if stop_requested {
                info!("Stop requested during backoff");
                return SupervisorOutcome::Stopped;
            }

            self.state.restart_count += 1;
            metrics::record_restart();
        }
    }

    /// Wait for the child. Returns `None` when a stop request drained it.
    async fn watch_child(
        &mut self,
        mut child: Box<dyn SupervisedChild>,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<ChildExit> {
        let event = tokio::select! {
            exit = child.wait() => Event::Exited(exit.unwrap_or_else(|e| {
                error!(error = %e, "Failed to wait for service child");
                ChildExit::Signaled(None)
            })),
            _ = stopped(stop) => Event::StopRequested,
        };

        match event {
            Event::Exited(exit) => Some(exit),
            Event::StopRequested => {
                info!(pid = ?child.pid(), "Stopping service child, waiting for current cycle");
                if let Err(e) = child.request_stop() {
                    warn!(error = %e, "Failed to signal service child");
                }
                match child.wait().await {
                    Ok(exit) => {
                        self.state.last_exit_code = exit.code();
                        info!(exit = ?exit, "Service child drained");
                    }
                    Err(e) => warn!(error = %e, "Failed to wait for service child"),
                }
                None
            }
        }
    }

    /// Supervise until SIGTERM/SIGINT or a terminal child exit
    pub async fn run_with_signals(&mut self) -> crate::Result<SupervisorOutcome> {
        let stop = crate::signals::shutdown_channel()?;
        Ok(self.run(stop).await)
    }
}
