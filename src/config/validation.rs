//! Configuration validation
//!
//! Checks an agent configuration for correctness and reports every problem at
//! once:
//! - A customer id is set
//! - Integrations have names and are not listed twice
//! - Service intervals and timeouts are non-zero
//! - The supervisor backoff policy is usable

use super::agent_config::AgentConfig;
use crate::error::EXIT_CODE_FATAL;
use crate::AgentError;
use std::collections::HashSet;

/// Validation error details
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub integration: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            integration: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_integration(mut self, integration: impl Into<String>) -> Self {
        self.integration = Some(integration.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref id) = self.integration {
            write!(f, "[{}] {}: {}", id, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// True when `name` joins onto a directory as exactly one entry below it
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

/// Validate an agent configuration
pub fn validate_config(config: &AgentConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.customer_id.trim().is_empty() {
        errors.push(ValidationError::new("customer_id", "Customer id must be set"));
    }

    let mut seen = HashSet::new();
    for (index, integration) in config.integrations.iter().enumerate() {
        let label = if integration.id.is_empty() {
            format!("#{}", index)
        } else {
            integration.id.to_string()
        };

        if integration.id.name.trim().is_empty() {
            errors.push(
                ValidationError::new("name", "Integration name cannot be empty")
                    .with_integration(&label),
            );
            continue;
        }
        if !is_plain_file_name(&integration.id.name) {
            errors.push(
                ValidationError::new("name", "Integration name cannot contain path separators")
                    .with_integration(&label),
            );
        }
        if !seen.insert(integration.id.clone()) {
            errors.push(
                ValidationError::new("integrations", "Integration listed more than once")
                    .with_integration(&label),
            );
        }
    }

    let service = &config.service;
    for (field, value) in [
        ("service.export_interval_secs", service.export_interval_secs),
        ("service.call_timeout_secs", service.call_timeout_secs),
        ("service.handshake_timeout_secs", service.handshake_timeout_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "Must be greater than 0"));
        }
    }

    let supervisor = &config.supervisor;
    if supervisor.multiplier < 1.0 {
        errors.push(ValidationError::new(
            "supervisor.multiplier",
            format!("Must be at least 1.0, got {}", supervisor.multiplier),
        ));
    }
    if supervisor.max_backoff_secs < supervisor.initial_backoff_secs {
        errors.push(ValidationError::new(
            "supervisor.max_backoff_secs",
            "Must not be smaller than initial_backoff_secs",
        ));
    }
    for code in &supervisor.fatal_exit_codes {
        if *code == 0 {
            errors.push(ValidationError::new(
                "supervisor.fatal_exit_codes",
                "Exit code 0 is a clean stop and cannot be fatal",
            ));
        } else if *code == EXIT_CODE_FATAL {
            tracing::debug!(code, "Fatal exit code listed explicitly, already implied");
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate configuration and return a Result
pub fn validate_config_result(config: &AgentConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        AgentError::ConfigInvalid(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_rpc::{IntegrationConfig, IntegrationId, IntegrationType};

    fn valid() -> AgentConfig {
        let mut config = AgentConfig::new("c-1");
        config.integrations.push(IntegrationConfig::new(IntegrationId::new(
            "jira",
            IntegrationType::Work,
        )));
        config
    }

    #[test]
    fn test_plain_file_names() {
        for name in ["jira", "gitlab-cloud", "a.b", "..jira"] {
            assert!(is_plain_file_name(name), "{}", name);
        }
        for name in ["", ".", "..", "../x", "a/b", "a\\b", "/bin/sh"] {
            assert!(!is_plain_file_name(name), "{}", name);
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&valid()).is_ok());
    }

    #[test]
    fn test_missing_customer_id() {
        let mut config = valid();
        config.customer_id.clear();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "customer_id");
    }

    #[test]
    fn test_duplicate_integrations() {
        let mut config = valid();
        config.integrations.push(config.integrations[0].clone());
        // Same name with a different type is a different integration
        config.integrations.push(IntegrationConfig::new(IntegrationId::new(
            "jira",
            IntegrationType::User,
        )));
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].integration.as_deref(), Some("jira@work"));
    }

    #[test]
    fn test_reports_every_problem() {
        let mut config = valid();
        config.customer_id.clear();
        config.service.call_timeout_secs = 0;
        config.supervisor.multiplier = 0.5;
        config.supervisor.fatal_exit_codes = vec![0];
        config
            .integrations
            .push(IntegrationConfig::new(IntegrationId::untyped("")));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn test_result_wrapper() {
        let mut config = valid();
        config.supervisor.max_backoff_secs = 1;
        config.supervisor.initial_backoff_secs = 10;
        let err = validate_config_result(&config).unwrap_err();
        assert!(err.to_string().contains("supervisor.max_backoff_secs"));
        assert!(err.is_fatal());
    }
}
