//! Demo RPC daemon.
//!
//! Binds a responder on the configured endpoint with a handful of string
//! operations registered, then serves until interrupted. Configuration
//! merges defaults, an optional `.dyad.toml`, `DYAD_`-prefixed environment
//! variables, and CLI flags, strongest last.

use anyhow::Result;
use clap::Parser;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::info;

use dyad::registry::HandlerError;
use dyad::{Peer, PeerConfig, RpcEndpoint, Value};

#[derive(Parser, Debug)]
#[command(name = "dyad", about = "Bidirectional RPC daemon")]
struct Cli {
    /// Endpoint to bind, e.g. tcp://0.0.0.0:9090
    #[arg(long)]
    bind: Option<String>,
    /// Application identity of this peer
    #[arg(long)]
    user_id: Option<String>,
    /// Auth backend plugin name
    #[arg(long)]
    security: Option<String>,
    /// Heartbeat backend plugin name
    #[arg(long)]
    heartbeat: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppConfig {
    bind: String,
    user_id: String,
    security: String,
    heartbeat: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "tcp://0.0.0.0:9090".to_owned(),
            user_id: "server".to_owned(),
            security: dyad::plugins::NOOP_AUTH_BACKEND.to_owned(),
            heartbeat: dyad::plugins::NOOP_HEARTBEAT_BACKEND.to_owned(),
        }
    }
}

impl AppConfig {
    fn load(cli: &Cli) -> Result<Self> {
        let mut config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(".dyad.toml"))
            .merge(Env::prefixed("DYAD_"))
            .extract()?;
        if let Some(bind) = &cli.bind {
            config.bind.clone_from(bind);
        }
        if let Some(user_id) = &cli.user_id {
            config.user_id.clone_from(user_id);
        }
        if let Some(security) = &cli.security {
            config.security.clone_from(security);
        }
        if let Some(heartbeat) = &cli.heartbeat {
            config.heartbeat.clone_from(heartbeat);
        }
        Ok(config)
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    }
}

fn register_demo_endpoints(peer: &Peer) {
    peer.register(RpcEndpoint::new("string.upper", |inv| async move {
        let s = expect_str(&inv.args)?;
        Ok(Value::from(s.to_uppercase()))
    }));
    peer.register(RpcEndpoint::new("string.lower", |inv| async move {
        let s = expect_str(&inv.args)?;
        Ok(Value::from(s.to_lowercase()))
    }));
    peer.register(RpcEndpoint::new("echo", |inv| async move {
        Ok(inv.args.into_iter().next().unwrap_or(Value::Nil))
    }));
}

fn expect_str(args: &[Value]) -> Result<String, HandlerError> {
    args.first()
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| HandlerError::new("TypeError", "expected a string argument"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli)?;

    let peer = Peer::responder(
        PeerConfig::new(config.user_id.clone().into_bytes())
            .security_plugin(config.security.clone())
            .heartbeat_plugin(config.heartbeat.clone()),
    )?;
    register_demo_endpoints(&peer);
    peer.bind(&config.bind)?;
    peer.start().await?;
    info!(bind = %config.bind, user_id = %config.user_id, "dyad listening");

    shutdown_signal().await;
    info!("shutdown signal received");
    peer.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn cli() -> Cli {
        Cli {
            bind: None,
            user_id: None,
            security: None,
            heartbeat: None,
        }
    }

    #[test]
    fn env_config_loading() {
        Jail::expect_with(|j| {
            j.set_env("DYAD_BIND", "tcp://127.0.0.1:8000");
            j.set_env("DYAD_USER_ID", "env-server");
            let cfg = AppConfig::load(&cli()).expect("load");
            assert_eq!(cfg.bind, "tcp://127.0.0.1:8000");
            assert_eq!(cfg.user_id, "env-server");
            Ok(())
        });
    }

    #[test]
    fn cli_overrides_env() {
        Jail::expect_with(|j| {
            j.set_env("DYAD_BIND", "tcp://127.0.0.1:8000");
            let mut args = cli();
            args.bind = Some("tcp://0.0.0.0:9000".to_owned());
            let cfg = AppConfig::load(&args).expect("load");
            assert_eq!(cfg.bind, "tcp://0.0.0.0:9000");
            Ok(())
        });
    }

    #[test]
    fn loads_from_dotfile() {
        Jail::expect_with(|j| {
            j.create_file(".dyad.toml", "bind = \"tcp://1.2.3.4:1111\"")?;
            let cfg = AppConfig::load(&cli()).expect("load");
            assert_eq!(cfg.bind, "tcp://1.2.3.4:1111");
            Ok(())
        });
    }
}
