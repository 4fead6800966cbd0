//! CLI command definitions
//!
//! All CLI structs and subcommand enums are defined here. The handlers live in
//! `main.rs`.

use crate::config::AgentConfig;
use crate::logging::LogFormat;
use crate::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Export agent - runs data-source integrations and ships incremental exports
#[derive(Parser, Debug)]
#[command(name = "export-agent")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Agent state directory (default: ~/.config/export-agent)
    #[arg(long, global = true, env = "EXPORT_AGENT_ROOT")]
    pub root: Option<PathBuf>,

    /// Log line format. Service commands always log JSON.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Directory holding integration binaries
    #[arg(long, global = true, env = "EXPORT_AGENT_INTEGRATIONS_DIR")]
    pub integrations_dir: Option<PathBuf>,

    /// JSON list of integrations replacing the configured ones
    #[arg(long, global = true, env = "EXPORT_AGENT_INTEGRATIONS_JSON")]
    pub integrations_json: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Export data from every configured integration
    Export {
        /// Ignore stored checkpoints and export all historical data
        #[arg(long)]
        reprocess_historical: bool,
    },

    /// Check the configuration of a single integration
    ValidateConfig,

    /// Fetch onboarding data (users, repos, projects or workconfig) from one integration
    ExportOnboardData {
        /// One of: users, repos, projects, workconfig
        #[arg(long)]
        object_type: String,
    },

    /// Run the export service under a restarting supervisor
    ServiceRun,

    /// Entry point used by the OS service manager
    #[command(hide = true)]
    ServiceRunInternal,

    /// Run the export service loop without a supervisor
    ServiceRunNoRestarts,

    /// Print the agent version
    Version,
}

impl Commands {
    /// Commands whose result is read by other programs from stdout
    pub fn is_machine_parsed(&self) -> bool {
        matches!(
            self,
            Commands::Export { .. } | Commands::ValidateConfig | Commands::ExportOnboardData { .. }
        )
    }

    pub fn is_service(&self) -> bool {
        matches!(
            self,
            Commands::ServiceRun | Commands::ServiceRunInternal | Commands::ServiceRunNoRestarts
        )
    }
}

impl Cli {
    /// Service commands log JSON so the supervisor can proxy child output
    pub fn effective_log_format(&self) -> LogFormat {
        if self.command.is_service() {
            LogFormat::Json
        } else {
            self.log_format
        }
    }

    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(AgentConfig::default_root)
    }

    /// Load `<root>/config.yaml` and apply command line overrides
    pub fn load_config(&self) -> Result<AgentConfig> {
        let mut config = AgentConfig::load_from_root(&self.root())?;
        if let Some(dir) = &self.integrations_dir {
            config.integrations_dir = Some(dir.clone());
        }
        if let Some(json) = &self.integrations_json {
            config.override_integrations(json)?;
        }
        Ok(config)
    }
}
