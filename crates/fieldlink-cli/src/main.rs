//! Command-line interface for the FieldLink relay.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use fieldlink_core::config::env_vars;
use fieldlink_core::FieldLinkConfig;

/// FieldLink - MQTT relay between field sensors/actuators and a document store.
#[derive(Parser, Debug)]
#[command(name = "fieldlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file.
    #[arg(short, long, global = true, env = env_vars::CONFIG_PATH)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay and its HTTP API.
    Serve(ServeArgs),
    /// Print the effective configuration as TOML and validate it.
    CheckConfig,
}

/// Overrides applied on top of file and environment configuration.
#[derive(ClapArgs, Debug, Default)]
struct ServeArgs {
    /// HTTP host to bind to.
    #[arg(long)]
    host: Option<String>,
    /// HTTP port to bind to.
    #[arg(short, long)]
    port: Option<u16>,
    /// MQTT broker host.
    #[arg(long)]
    broker: Option<String>,
    /// MQTT broker port.
    #[arg(long)]
    broker_port: Option<u16>,
    /// Database file path.
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    match args.command {
        Command::Serve(overrides) => {
            let config = resolve_config(args.config.as_deref(), &overrides)?;
            tracing::info!(
                version = fieldlink_core::VERSION,
                broker = %config.mqtt.broker_addr(),
                http = %config.http.bind,
                "starting fieldlink"
            );
            fieldlink_api::run(config).await
        }
        Command::CheckConfig => {
            let config = resolve_config(args.config.as_deref(), &ServeArgs::default())?;
            print!("{}", config.to_toml()?);
            eprintln!("configuration is valid");
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directive = if verbose { "fieldlink=debug" } else { "fieldlink=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

/// Defaults, then file, then environment, then command-line flags.
fn resolve_config(path: Option<&std::path::Path>, overrides: &ServeArgs) -> Result<FieldLinkConfig> {
    let mut config = FieldLinkConfig::load(path)?;
    apply_overrides(&mut config, overrides)?;
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut FieldLinkConfig, overrides: &ServeArgs) -> Result<()> {
    if let Some(broker) = &overrides.broker {
        config.mqtt.host = broker.clone();
    }
    if let Some(port) = overrides.broker_port {
        config.mqtt.port = port;
    }
    if let Some(db) = &overrides.db {
        config.storage.path = db.clone();
    }

    if overrides.host.is_some() || overrides.port.is_some() {
        let current: SocketAddr = config
            .http
            .bind
            .parse()
            .with_context(|| format!("invalid http.bind '{}'", config.http.bind))?;
        let host = match &overrides.host {
            Some(host) => host
                .parse()
                .with_context(|| format!("invalid --host '{}'", host))?,
            None => current.ip(),
        };
        let port = overrides.port.unwrap_or(current.port());
        config.http.bind = SocketAddr::new(host, port).to_string();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_flags() {
        let args = Args::try_parse_from([
            "fieldlink",
            "serve",
            "--broker",
            "mqtt.farm.local",
            "--broker-port",
            "8883",
            "--port",
            "8080",
        ])
        .unwrap();
        match args.command {
            Command::Serve(serve) => {
                assert_eq!(serve.broker.as_deref(), Some("mqtt.farm.local"));
                assert_eq!(serve.broker_port, Some(8883));
                assert_eq!(serve.port, Some(8080));
                assert!(serve.host.is_none());
            }
            Command::CheckConfig => panic!("expected serve"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args =
            Args::try_parse_from(["fieldlink", "check-config", "--verbose", "--config", "a.toml"])
                .unwrap();
        assert!(args.verbose);
        assert_eq!(args.config, Some(PathBuf::from("a.toml")));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = FieldLinkConfig::default();
        let overrides = ServeArgs {
            host: Some("127.0.0.1".to_string()),
            port: Some(8080),
            broker: Some("broker.example".to_string()),
            broker_port: Some(1884),
            db: Some("/tmp/fl.redb".to_string()),
        };
        apply_overrides(&mut config, &overrides).unwrap();

        assert_eq!(config.http.bind, "127.0.0.1:8080");
        assert_eq!(config.mqtt.host, "broker.example");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.storage.path, "/tmp/fl.redb");
        config.validate().unwrap();
    }

    #[test]
    fn test_port_only_keeps_host() {
        let mut config = FieldLinkConfig::default();
        let overrides = ServeArgs {
            port: Some(9000),
            ..Default::default()
        };
        apply_overrides(&mut config, &overrides).unwrap();
        assert_eq!(config.http.bind, "0.0.0.0:9000");
    }

    #[test]
    fn test_bad_host_is_rejected() {
        let mut config = FieldLinkConfig::default();
        let overrides = ServeArgs {
            host: Some("not an ip".to_string()),
            ..Default::default()
        };
        assert!(apply_overrides(&mut config, &overrides).is_err());
    }
}
