// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service Connector broker CLI
//!
//! # Usage
//!
//! ```bash
//! # Defaults (0.0.0.0:9000, services created on registration)
//! sc-broker
//!
//! # Using configuration file
//! sc-broker --config broker.toml
//!
//! # Override listener
//! sc-broker --config broker.toml --bind 127.0.0.1 --port 9100
//! ```

use clap::{Parser, Subcommand};
use sc_broker::{Broker, BrokerConfig, BrokerServer, ServiceConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Service Connector broker
#[derive(Parser, Debug)]
#[command(name = "sc-broker")]
#[command(about = "Service Connector broker - sessions, pooled backends and pub/sub over SCMP")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listener address (overrides the configuration file)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Listener port (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error). Defaults to the
    /// configuration file's level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "broker.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;

    let filter = EnvFilter::try_new(args.log_level.as_deref().unwrap_or(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let broker = Broker::tcp(config)?;
    let server = BrokerServer::new(broker.clone());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        services = broker.services().len(),
        "starting Service Connector"
    );

    let ctrl_c = broker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.shutdown();
        }
    });

    server.run().await?;
    info!("broker stopped");
    Ok(())
}

fn build_config(args: &Args) -> Result<BrokerConfig, Box<dyn std::error::Error>> {
    let mut config = match args.config {
        Some(ref path) => BrokerConfig::from_file(path)?,
        None => BrokerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ref level) = args.log_level {
        config.log_level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = BrokerConfig {
        name: "example-broker".into(),
        ..Default::default()
    };
    config.add_service(ServiceConfig::session("billing").with_echo_interval(Duration::from_secs(30)));
    config.add_service(ServiceConfig::publish("quotes", 10).with_wildcard('-'));
    config.add_service(ServiceConfig::session("maintenance").disabled());

    let toml_str = toml::to_string_pretty(&config)?;

    let content = format!(
        r#"# Service Connector broker configuration
# Generated by sc-broker gen-config

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match BrokerConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Broker: {}", config.name);
            println!("Listen: {}", config.listen_address());
            println!("Services: {}", config.services.len());
            for service in &config.services {
                println!(
                    "  {} ({}){}",
                    service.name,
                    service.kind.as_str(),
                    if service.enabled { "" } else { " [disabled]" }
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
