//! railbus - resilient pub/sub client
//!
//! Usage:
//!   railbus [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>         Configuration file path
//!   -e, --endpoint <URL>        Remote broker endpoint (mqtt://host:port)
//!   --prefer-local              Skip the remote broker
//!   -s, --subscribe <PATTERN>   Pattern to print messages for (repeatable)
//!   -p, --publish <TOPIC=VALUE> Message to publish after connecting (repeatable)
//!   -l, --log-level             Log level (error, warn, info, debug, trace)
//!   -h, --help                  Print help

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use railbus::config::Config;
use railbus::local::LocalBroker;
use railbus::message::{Payload, PublishOptions};
use railbus::BrokerClient;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }

    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// railbus - pub/sub client with remote MQTT broker and local fallback
#[derive(Parser, Debug)]
#[command(name = "railbus")]
#[command(author = "Railbus Contributors")]
#[command(version)]
#[command(about = "Resilient pub/sub client with remote MQTT broker and in-process fallback")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Remote broker endpoint
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Skip the remote broker and use the in-process one
    #[arg(long)]
    prefer_local: bool,

    /// Pattern to print messages for (`*` one level, trailing `>` the rest)
    #[arg(short, long, default_value = "tms/>")]
    subscribe: Vec<String>,

    /// Message to publish once connected, as `topic=value`
    #[arg(short, long, value_parser = parse_publish)]
    publish: Vec<(String, String)>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn parse_publish(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((topic, value)) if !topic.is_empty() => Ok((topic.to_string(), value.to_string())),
        _ => Err(format!("expected topic=value, got '{}'", s)),
    }
}

/// JSON values pass through as structured payloads, anything else as text
fn payload_from_arg(value: &str) -> Payload {
    match serde_json::from_str::<serde_json::Value>(value) {
        Ok(v) if v.is_object() || v.is_array() => Payload::Structured(v),
        _ => Payload::Text(value.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => match Config::from_env() {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading configuration: {}", e);
                std::process::exit(1);
            }
        },
    };

    // CLI args override file config
    if let Some(endpoint) = args.endpoint {
        config.broker.endpoint = endpoint;
    }
    if args.prefer_local {
        config.failover.prefer_local = true;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }
    info!("Starting railbus client");
    info!("  Endpoint: {}", config.broker.endpoint);
    info!("  VPN: {}", config.broker.vpn);
    info!("  Client ID: {}", config.broker.client_id);
    info!(
        "  Failover: max_attempts={}, cooldown={:?}, prefer_local={}",
        config.failover.max_attempts, config.failover.cooldown, config.failover.prefer_local
    );

    let local_broker = LocalBroker::new(&config.local);
    let client = BrokerClient::new(&config, local_broker.clone());

    match client.connect().await {
        Ok(kind) => info!("Connected via {} backend", kind),
        Err(e) => {
            error!("Could not connect: {}", e);
            std::process::exit(1);
        }
    }

    for pattern in &args.subscribe {
        let result = client
            .subscribe(pattern, |topic, payload, message| {
                let line = json!({
                    "topic": topic,
                    "payload": payload,
                    "content_type": message.content_type,
                    "correlation_id": message.correlation_id,
                });
                println!("{}", line);
            })
            .await;
        if let Err(e) = result {
            error!("Subscribe to '{}' failed: {}", pattern, e);
        }
    }

    for (topic, value) in &args.publish {
        if let Err(e) = client
            .publish(topic, payload_from_arg(value), PublishOptions::default())
            .await
        {
            error!("Publish to '{}' failed: {}", topic, e);
        }
    }

    println!("{}", serde_json::to_string(&client.status())?);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    client.disconnect().await?;
    local_broker.shutdown();
    Ok(())
}
