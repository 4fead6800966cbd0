//! Agent configuration file handling
//!
//! Loads `<root>/config.yaml`. The root defaults to ~/.config/export-agent and
//! also holds the checkpoint database, exports and integration binaries.

use crate::{AgentError, Result};
use agent_rpc::{ExportConfig, IntegrationConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Service loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Seconds between export cycles
    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,

    /// Upper bound for a single integration call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// How long a launched integration may take to say hello
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_export_interval() -> u64 {
    15 * 60
}

fn default_call_timeout() -> u64 {
    6 * 60 * 60
}

fn default_handshake_timeout() -> u64 {
    10
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            export_interval_secs: default_export_interval(),
            call_timeout_secs: default_call_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl ServiceConfig {
    pub fn export_interval(&self) -> Duration {
        Duration::from_secs(self.export_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Restart policy of the process supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// A child that ran this long resets the crash counter
    #[serde(default = "default_healthy_after")]
    pub healthy_after_secs: u64,

    /// Extra exit codes treated as fatal, besides 78
    #[serde(default)]
    pub fatal_exit_codes: Vec<i32>,
}

fn default_initial_backoff() -> u64 {
    5
}

fn default_max_backoff() -> u64 {
    300
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_healthy_after() -> u64 {
    600
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            multiplier: default_multiplier(),
            healthy_after_secs: default_healthy_after(),
            fatal_exit_codes: Vec::new(),
        }
    }
}

/// Export agent configuration
///
/// Represents the complete `<root>/config.yaml` file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub customer_id: String,

    /// Directory holding integration binaries. Defaults to `<root>/integrations`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrations_dir: Option<PathBuf>,

    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub supervisor: SupervisorSettings,
}

impl AgentConfig {
    pub fn new(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `<root>/config.yaml`
    pub fn load_from_root(root: &Path) -> Result<Self> {
        Self::load(root.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(AgentError::ConfigInvalid(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading agent configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            integrations = config.integrations.len(),
            interval_secs = config.service.export_interval_secs,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving agent configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Default root directory (~/.config/export-agent)
    pub fn default_root() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("export-agent");
        path
    }

    /// Where integration binaries are looked up
    pub fn integrations_dir(&self, root: &Path) -> PathBuf {
        match &self.integrations_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => root.join("integrations"),
        }
    }

    /// Replace the configured integrations with a JSON array given on the command line
    pub fn override_integrations(&mut self, json: &str) -> Result<()> {
        self.integrations = parse_integrations_json(json)?;
        Ok(())
    }

    /// Build the per-invocation parameters for one integration
    pub fn export_config(
        &self,
        integration: &IntegrationConfig,
        reprocess_historical: bool,
    ) -> ExportConfig {
        ExportConfig {
            customer_id: self.customer_id.clone(),
            agent_hostname: agent_hostname(),
            integration: integration.clone(),
            reprocess_historical,
        }
    }
}

/// Parse `[{"name": "jira", "type": "work", "config": {...}}, ...]`
pub fn parse_integrations_json(json: &str) -> Result<Vec<IntegrationConfig>> {
    serde_json::from_str(json)
        .map_err(|e| AgentError::ConfigInvalid(format!("invalid integrations JSON: {}", e)))
}

fn agent_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_rpc::{IntegrationId, IntegrationType};
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
customer_id: c-123
integrations:
  - name: jira
    type: work
    config:
      url: https://example.atlassian.net
      username: bot
  - name: github
    type: sourcecode
service:
  export_interval_secs: 60
supervisor:
  fatal_exit_codes: [3]
"#;

    #[test]
    fn test_parse_yaml() {
        let config: AgentConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.customer_id, "c-123");
        assert_eq!(config.integrations.len(), 2);
        assert_eq!(config.integrations[0].id.to_string(), "jira@work");
        assert_eq!(
            config.integrations[0].setting_str("username"),
            Some("bot")
        );
        assert_eq!(config.service.export_interval_secs, 60);
        assert_eq!(config.service.handshake_timeout_secs, 10);
        assert_eq!(config.supervisor.fatal_exit_codes, vec![3]);
        assert_eq!(config.supervisor.multiplier, 2.0);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = AgentConfig::new("c-1");
        config.integrations.push(IntegrationConfig::new(IntegrationId::new(
            "gitlab",
            IntegrationType::Sourcecode,
        )));

        config.save(temp_dir.path().join(CONFIG_FILE_NAME)).unwrap();
        let loaded = AgentConfig::load_from_root(temp_dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = AgentConfig::load_from_root(temp_dir.path()).unwrap_err();
        assert!(matches!(err, AgentError::ConfigInvalid(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_integrations_dir() {
        let root = Path::new("/var/lib/agent");
        let mut config = AgentConfig::default();
        assert_eq!(
            config.integrations_dir(root),
            PathBuf::from("/var/lib/agent/integrations")
        );
        config.integrations_dir = Some(PathBuf::from("bin"));
        assert_eq!(config.integrations_dir(root), PathBuf::from("/var/lib/agent/bin"));
        config.integrations_dir = Some(PathBuf::from("/opt/integrations"));
        assert_eq!(config.integrations_dir(root), PathBuf::from("/opt/integrations"));
    }

    #[test]
    fn test_integrations_json_override() {
        let mut config: AgentConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config
            .override_integrations(r#"[{"name":"bitbucket","type":"sourcecode","config":{"token":"x"}}]"#)
            .unwrap();
        assert_eq!(config.integrations.len(), 1);
        assert_eq!(config.integrations[0].id.to_string(), "bitbucket@sourcecode");

        assert!(config.override_integrations("{not json").is_err());
    }

    #[test]
    fn test_export_config() {
        let config: AgentConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let export = config.export_config(&config.integrations[0], true);
        assert_eq!(export.customer_id, "c-123");
        assert!(export.reprocess_historical);
        assert_eq!(export.integration.id.name, "jira");
    }
}
