//! JSON documents written by the session commands

use crate::AgentError;
use agent_rpc::{IntegrationId, OnboardExportResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Output of `validate-config`
///
/// Field order is part of the contract: `{"errors":[...],"success":...,"server_version":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateOutput {
    pub errors: Vec<String>,
    pub success: bool,
    pub server_version: String,
}

impl ValidateOutput {
    pub fn new(server_version: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            success: errors.is_empty(),
            errors,
            server_version: server_version.into(),
        }
    }

    /// Report a failure that happened before the integration could answer
    pub fn failed(err: &AgentError) -> Self {
        Self::new("", vec![err.to_string()])
    }
}

/// Output of `export-onboard-data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnboardOutput {
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl OnboardOutput {
    pub fn failed(err: &AgentError) -> Self {
        Self {
            data: None,
            error: Some(err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl From<OnboardExportResult> for OnboardOutput {
    fn from(result: OnboardExportResult) -> Self {
        Self {
            data: result.data,
            error: result.error,
        }
    }
}

/// Outcome of one integration within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationReport {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub cancelled: bool,

    pub duration_ms: u64,

    /// Records delivered, keyed by object type
    #[serde(default)]
    pub records: BTreeMap<String, u64>,
}

impl IntegrationReport {
    pub(crate) fn new(id: &IntegrationId, duration: Duration) -> Self {
        Self {
            id: id.to_string(),
            error: None,
            cancelled: false,
            duration_ms: duration.as_millis() as u64,
            records: BTreeMap::new(),
        }
    }

    pub(crate) fn cancelled(id: &IntegrationId) -> Self {
        Self {
            error: Some(AgentError::Cancelled.to_string()),
            cancelled: true,
            ..Self::new(id, Duration::ZERO)
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate result of an export session
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionReport {
    pub integrations: Vec<IntegrationReport>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.integrations.iter().all(IntegrationReport::is_success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &IntegrationReport> {
        self.integrations.iter().filter(|r| !r.is_success())
    }

    pub fn get(&self, id: &IntegrationId) -> Option<&IntegrationReport> {
        let id = id.to_string();
        self.integrations.iter().find(|r| r.id == id)
    }

    pub fn total_records(&self) -> u64 {
        self.integrations
            .iter()
            .flat_map(|r| r.records.values())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_output_exact_json() {
        let ok = ValidateOutput::new("9.12.0", vec![]);
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"errors":[],"success":true,"server_version":"9.12.0"}"#
        );

        let bad = ValidateOutput::new("", vec!["bad auth".to_string()]);
        assert_eq!(
            serde_json::to_string(&bad).unwrap(),
            r#"{"errors":["bad auth"],"success":false,"server_version":""}"#
        );
    }

    #[test]
    fn test_onboard_output_keeps_both_fields() {
        let out = OnboardOutput::from(OnboardExportResult::data(serde_json::json!([{"login": "ana"}])));
        assert_eq!(
            serde_json::to_string(&out).unwrap(),
            r#"{"data":[{"login":"ana"}],"error":null}"#
        );
        assert!(out.is_success());
    }

    #[test]
    fn test_session_report_aggregates() {
        let jira = IntegrationId::untyped("jira");
        let mut ok = IntegrationReport::new(&jira, Duration::from_millis(1500));
        ok.records.insert("work.issue".to_string(), 12);
        ok.records.insert("work.user".to_string(), 3);
        let report = SessionReport {
            integrations: vec![ok, IntegrationReport::cancelled(&IntegrationId::untyped("github"))],
        };

        assert!(!report.is_success());
        assert_eq!(report.total_records(), 15);
        assert_eq!(report.get(&jira).unwrap().duration_ms, 1500);
        assert_eq!(report.failed().count(), 1);
    }
}
