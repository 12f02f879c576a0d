//! Service configuration, from flags or the environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::pipeline::{DispatchPolicy, PipelineConfig};

/// Receive source-control webhooks, render instruction templates, and hand
/// them to the analysis agent.
#[derive(Debug, Clone, Parser)]
#[command(name = "nexus-webhook-agent", version)]
pub struct Config {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 4665)]
    pub port: u16,

    /// Address to bind.
    #[arg(long, env = "BIND_ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Shared webhook secret. Leave empty to accept unsigned deliveries.
    #[arg(long, env = "GITHUB_WEBHOOK_SECRET", default_value = "", hide_env_values = true)]
    pub secret: String,

    /// SQLite database holding the audit log.
    #[arg(long, env = "DATABASE_PATH", default_value = "./hls_webhooks.db")]
    pub database: PathBuf,

    /// Root of the template namespace.
    #[arg(long, env = "PROMPTS_DIR", default_value = "./prompts")]
    pub prompts_dir: PathBuf,

    /// Run the agent automatically after a document is rendered.
    #[arg(
        long,
        env = "AUTO_DISPATCH",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub auto_dispatch: bool,

    /// Only auto-dispatch payloads mentioning this tag (e.g. `@clide`).
    #[arg(long, env = "DISPATCH_TAG")]
    pub dispatch_tag: Option<String>,

    /// Seconds an agent run may take before it is killed.
    #[arg(long, env = "AGENT_TIMEOUT_SECS", default_value_t = 1800)]
    pub agent_timeout_secs: u64,

    /// Skip auto-dispatch for a delivery id that is already on record.
    #[arg(
        long,
        env = "SKIP_REDELIVERED",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub skip_redelivered: bool,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs.max(1))
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            secret: self.secret.clone(),
            dispatch: DispatchPolicy {
                auto_dispatch: self.auto_dispatch,
                tag: self
                    .dispatch_tag
                    .clone()
                    .filter(|tag| !tag.trim().is_empty()),
            },
            skip_redelivered: self.skip_redelivered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["nexus-webhook-agent"]).unwrap();
        assert_eq!(config.listen_addr().port(), 4665);
        assert_eq!(config.agent_timeout(), Duration::from_secs(1800));
        let pipeline = config.pipeline();
        assert!(pipeline.dispatch.auto_dispatch);
        assert_eq!(pipeline.dispatch.tag, None);
        assert!(!pipeline.skip_redelivered);
    }

    #[test]
    fn flags_override() {
        let config = Config::try_parse_from([
            "nexus-webhook-agent",
            "--port",
            "8080",
            "--secret",
            "s3cret",
            "--auto-dispatch",
            "false",
            "--dispatch-tag",
            "@clide",
            "--skip-redelivered",
            "true",
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        let pipeline = config.pipeline();
        assert_eq!(pipeline.secret, "s3cret");
        assert!(!pipeline.dispatch.auto_dispatch);
        assert_eq!(pipeline.dispatch.tag.as_deref(), Some("@clide"));
        assert!(pipeline.skip_redelivered);
    }

    #[test]
    fn blank_tag_means_no_tag() {
        let config =
            Config::try_parse_from(["nexus-webhook-agent", "--dispatch-tag", " "]).unwrap();
        assert_eq!(config.pipeline().dispatch.tag, None);
    }
}
