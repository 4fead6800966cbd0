//! Integration identifiers
//!
//! A single integration binary may host several integrations distinguished by
//! type, so an integration is addressed by its binary name plus an optional type.

use crate::RpcError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// System type of an integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationType {
    Work,
    Sourcecode,
    Codequality,
    User,
    #[default]
    Unset,
}

impl IntegrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::Sourcecode => "sourcecode",
            Self::Codequality => "codequality",
            Self::User => "user",
            Self::Unset => "unset",
        }
    }

    /// Wire name passed to integration binaries (`WORK`, `SOURCECODE`, ...)
    pub fn wire_name(&self) -> Option<&'static str> {
        match self {
            Self::Work => Some("WORK"),
            Self::Sourcecode => Some("SOURCECODE"),
            Self::Codequality => Some("CODEQUALITY"),
            Self::User => Some("USER"),
            Self::Unset => None,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }
}

impl fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IntegrationType {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WORK" => Ok(Self::Work),
            "SOURCECODE" => Ok(Self::Sourcecode),
            "CODEQUALITY" => Ok(Self::Codequality),
            "USER" => Ok(Self::User),
            _ => Err(RpcError::InvalidIntegrationType(s.to_string())),
        }
    }
}

/// Unique identifier of a loadable integration
///
/// Displays as `name` when the type is unset and `name@type` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IntegrationId {
    pub name: String,

    #[serde(rename = "type", default)]
    pub integration_type: IntegrationType,
}

impl IntegrationId {
    pub fn new(name: impl Into<String>, integration_type: IntegrationType) -> Self {
        Self {
            name: name.into(),
            integration_type,
        }
    }

    /// Identifier for a binary that hosts a single integration
    pub fn untyped(name: impl Into<String>) -> Self {
        Self::new(name, IntegrationType::Unset)
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

impl fmt::Display for IntegrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.integration_type.is_unset() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}@{}", self.name, self.integration_type)
        }
    }
}

impl FromStr for IntegrationId {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((name, ty)) if !name.is_empty() => Ok(Self::new(name, ty.parse()?)),
            Some(_) => Err(RpcError::InvalidIntegrationId(s.to_string())),
            None => Ok(Self::untyped(s)),
        }
    }
}
