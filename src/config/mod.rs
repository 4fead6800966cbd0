//! Configuration system
//!
//! Loads `<root>/config.yaml` with:
//! - The customer identity sent with every export
//! - The integrations to run and their opaque settings
//! - Service loop intervals and call timeouts
//! - Supervisor restart policy

mod agent_config;
pub mod validation;

pub use agent_config::{
    parse_integrations_json, AgentConfig, ServiceConfig, SupervisorSettings, CONFIG_FILE_NAME,
};
pub use validation::{
    is_plain_file_name, validate_config, validate_config_result, ValidationError,
};
