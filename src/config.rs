//! Command line and environment settings.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::AccessGuard;
use crate::proxy::DispatchSettings;

pub const DEFAULT_CONFIG_PATH: &str = "config/models.yaml";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Parser)]
#[command(
    name = "modelgate",
    version,
    about = "OpenAI-compatible gateway routing requests to model backends by name"
)]
pub struct Cli {
    #[command(flatten)]
    pub settings: GatewaySettings,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the HTTP gateway (default).
    Serve,
    /// Print the configured model backends and exit.
    Models,
}

#[derive(Debug, Clone, Args)]
pub struct GatewaySettings {
    /// Path of the YAML model config.
    #[arg(long = "config", env = "MODELS_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config_path: PathBuf,

    /// Address the HTTP server binds to.
    #[arg(long = "bind", env = "BIND_ADDR", default_value = DEFAULT_BIND_ADDR, global = true)]
    pub bind_addr: String,

    /// Bearer token required on model-facing endpoints. Unset means open access.
    #[arg(long, env = "API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Per-call backend timeout in seconds.
    #[arg(long, env = "MODELGATE_HTTP_TIMEOUT_SECONDS", default_value_t = 10, global = true)]
    pub timeout_seconds: u64,

    /// Maximum concurrently open backend connections.
    #[arg(long, env = "MODELGATE_MAX_CONNECTIONS", default_value_t = 100, global = true)]
    pub max_connections: usize,

    /// Maximum idle pooled connections per backend host.
    #[arg(long, env = "MODELGATE_MAX_IDLE_CONNECTIONS", default_value_t = 20, global = true)]
    pub max_idle_connections: usize,

    /// Retries for backend connection failures.
    #[arg(long, env = "MODELGATE_RETRIES", default_value_t = 3, global = true)]
    pub retries: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        let dispatch = DispatchSettings::default();
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            api_key: None,
            timeout_seconds: dispatch.timeout.as_secs(),
            max_connections: dispatch.max_connections,
            max_idle_connections: dispatch.max_idle_connections,
            retries: dispatch.retries,
        }
    }
}

impl GatewaySettings {
    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            timeout: Duration::from_secs(self.timeout_seconds.max(1)),
            max_connections: self.max_connections.max(1),
            max_idle_connections: self.max_idle_connections,
            retries: self.retries,
        }
    }

    pub fn access_guard(&self) -> AccessGuard {
        AccessGuard::new(self.api_key.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "modelgate",
            "--config",
            "/etc/modelgate/models.yaml",
            "--api-key",
            "s3cret",
            "--timeout-seconds",
            "30",
            "models",
        ]);
        assert_eq!(cli.command, Some(Command::Models));
        assert_eq!(
            cli.settings.config_path,
            PathBuf::from("/etc/modelgate/models.yaml")
        );
        assert!(cli.settings.access_guard().is_enabled());
        assert_eq!(
            cli.settings.dispatch_settings().timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn default_settings_match_dispatch_defaults() {
        let settings = GatewaySettings::default();
        let dispatch = settings.dispatch_settings();
        assert_eq!(dispatch.max_connections, 100);
        assert_eq!(dispatch.max_idle_connections, 20);
        assert_eq!(dispatch.retries, 3);
        assert!(!settings.access_guard().is_enabled());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
