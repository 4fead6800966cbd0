//! Source control connectivity probe used by validate-config

use crate::{AgentError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::oneshot;
use url::Url;

/// Default upper bound for one probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Checks that a repository URL returned by an integration is reachable
#[async_trait]
pub trait RepoProbe: Send + Sync {
    async fn probe(&self, url: &str) -> Result<()>;
}

/// Connects to the remote with libgit2 and lists its refs
#[derive(Debug, Clone)]
pub struct GitRemoteProbe {
    timeout: Duration,
}

impl Default for GitRemoteProbe {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl GitRemoteProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl RepoProbe for GitRemoteProbe {
    async fn probe(&self, url: &str) -> Result<()> {
        let target = url.to_string();
        let task = run_detached(move || -> Result<()> {
            let mut remote = git2::Remote::create_detached(target.as_str())?;
            remote.connect(git2::Direction::Fetch)?;
            remote.list()?;
            remote.disconnect()?;
            Ok(())
        })?;

        bounded(url, self.timeout, task).await
    }
}

/// Run blocking work on its own thread.
///
/// libgit2 cannot be interrupted, so the thread is never joined: a runtime
/// shutting down after a timeout does not wait for it.
fn run_detached<T, F>(work: F) -> Result<oneshot::Receiver<Result<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("repo-connect".to_string())
        .spawn(move || {
            let _ = tx.send(work());
        })?;
    Ok(rx)
}

async fn bounded<T>(url: &str, timeout: Duration, task: oneshot::Receiver<Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, task).await {
        Err(_) => {
            tracing::warn!(url = %redact_url(url), "Repository check timed out, leaving connect behind");
            Err(AgentError::Timeout {
                id: redact_url(url),
                operation: "repo probe".to_string(),
                secs: timeout.as_secs(),
            })
        }
        Ok(Err(_)) => Err(AgentError::Other("repo probe aborted".to_string())),
        Ok(Ok(result)) => result,
    }
}

/// Remove user info from a URL so it can be logged
///
/// scp-style remotes (`git@host:org/repo`) lose everything before the `@`.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if !url.username().is_empty() || url.password().is_some() {
                let _ = url.set_username("");
                let _ = url.set_password(None);
            }
            url.to_string()
        }
        Err(_) => match raw.rsplit_once('@') {
            Some((_, host)) => host.to_string(),
            None => raw.to_string(),
        },
    }
}
