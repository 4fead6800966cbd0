//! Data passed across the integration boundary

use crate::{IntegrationId, RpcError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A single exported object. Opaque to the agent.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Error returned by integrations for onboarding types they do not support
pub const ONBOARD_NOT_SUPPORTED: &str = "onboard export not supported for this object type";

/// Persisted configuration of one integration
///
/// `settings` holds URLs, credentials, inclusion/exclusion lists and tokens.
/// The agent never interprets them, it only forwards them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IntegrationConfig {
    #[serde(flatten)]
    pub id: IntegrationId,

    #[serde(default, rename = "config")]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl IntegrationConfig {
    pub fn new(id: IntegrationId) -> Self {
        Self {
            id,
            settings: serde_json::Map::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Read a string setting, treating empty strings as missing
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Read a required string setting
    pub fn require_str(&self, key: &str) -> crate::Result<&str> {
        self.setting_str(key)
            .ok_or_else(|| RpcError::Config(format!("{} is missing", key)))
    }
}

/// Parameters sent to an integration for one invocation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    pub customer_id: String,

    #[serde(default)]
    pub agent_hostname: String,

    pub integration: IntegrationConfig,

    /// Discard incremental checkpoints and reprocess historical data
    #[serde(default)]
    pub reprocess_historical: bool,
}

/// Result of a full export
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExportResult {
    /// Records sent, keyed by object type
    #[serde(default)]
    pub records_sent: HashMap<String, u64>,
}

/// Result of validating an integration's configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    #[serde(default)]
    pub server_version: String,

    /// Set by source control integrations so the agent can probe the remote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,

    #[serde(default)]
    pub errors: Vec<String>,
}

/// Object types that can be listed during onboarding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnboardExportType {
    Users,
    Repos,
    Projects,
    Workconfig,
}

impl OnboardExportType {
    pub const ALL: [OnboardExportType; 4] = [
        OnboardExportType::Users,
        OnboardExportType::Repos,
        OnboardExportType::Projects,
        OnboardExportType::Workconfig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Repos => "repos",
            Self::Projects => "projects",
            Self::Workconfig => "workconfig",
        }
    }
}

impl fmt::Display for OnboardExportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OnboardExportType {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| RpcError::InvalidOnboardType(s.to_string()))
    }
}

/// Result of an onboarding export
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OnboardExportResult {
    #[serde(default)]
    pub data: Option<serde_json::Value>,

    #[serde(default)]
    pub error: Option<String>,
}

impl OnboardExportResult {
    pub fn data(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn not_supported() -> Self {
        Self {
            data: None,
            error: Some(ONBOARD_NOT_SUPPORTED.to_string()),
        }
    }
}

/// Operation an integration can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Export,
    ValidateConfig,
    OnboardExport,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Export => write!(f, "export"),
            Self::ValidateConfig => write!(f, "validate_config"),
            Self::OnboardExport => write!(f, "onboard_export"),
        }
    }
}

/// Set of capabilities declared by an integration at handshake
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(Vec<Capability>);

impl Capabilities {
    pub fn all() -> Self {
        Self(vec![
            Capability::Export,
            Capability::ValidateConfig,
            Capability::OnboardExport,
        ])
    }

    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, capability: Capability) -> Self {
        if !self.0.contains(&capability) {
            self.0.push(capability);
        }
        self
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        iter.into_iter().fold(Self::none(), Self::with)
    }
}
