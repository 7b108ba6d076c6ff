//! Reliable Queue development harness.
//!
//! Loads configuration (file or env overrides), wires a `ReliableQueueFacade`,
//! subscribes every `Receive`/`Both` queue with a logging demo subscriber,
//! and sends one seed message to every `Send`/`Both` queue so a fresh
//! checkout has something to watch flow through on first run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use rq_common::Message;
use rq_config::{AppConfig, ConfigLoader};
use rq_facade::{ReliableQueueFacade, Subscriber};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rq-dev", about = "Reliable Queue development harness")]
struct Args {
    /// Path to a TOML config file. Falls back to the standard search paths
    /// and `RELIABLE_QUEUE_CONFIG` when omitted.
    #[arg(long, env = "RELIABLE_QUEUE_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Skip sending the demo seed message to each Send-capable queue.
    #[arg(long)]
    no_seed: bool,
}

struct LoggingSubscriber {
    queue_name: String,
}

#[async_trait]
impl Subscriber for LoggingSubscriber {
    async fn handle(&self, message: &Message) -> bool {
        info!(
            queue = %self.queue_name,
            message_id = %message.id,
            topic = %message.topic,
            body_is_null = message.body_is_null,
            "received message"
        );
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    rq_common::logging::init_logging("rq-dev");

    let args = Args::parse();

    let config: AppConfig = match &args.config {
        Some(path) => ConfigLoader::with_path(path.clone()).load().context("loading config from --config path")?,
        None => AppConfig::load().context("loading config from standard search paths")?,
    };

    if config.queues.is_empty() {
        info!("no queues configured; see rq-config's example_toml() for a starting point");
    }

    let instance_id = std::env::var("HOSTNAME").unwrap_or_else(|_| "rq-dev".to_string());
    let facade = Arc::new(ReliableQueueFacade::from_config(&config, instance_id).context("building reliable queue facade")?);

    let mut tokens = Vec::new();
    for (name, def) in config.enabled_queues() {
        if facade.can_receive(name).unwrap_or(false) {
            let token = facade
                .subscribe(name, Arc::new(LoggingSubscriber { queue_name: name.clone() }))
                .await
                .with_context(|| format!("subscribing to queue {name}"))?;
            tokens.push(token);
            info!(queue = %name, "subscribed demo handler");
        }

        if !args.no_seed && def.is_enabled && facade.can_send(name).unwrap_or(false) {
            let seeded = facade
                .send(name, Some("dev-seed"), Some(br#"{"hello":"rq-dev"}"#.to_vec()))
                .await
                .with_context(|| format!("sending seed message to {name}"))?;
            info!(queue = %name, message_id = %seeded.id, "seeded demo message");
        }
    }

    info!("rq-dev running. Press Ctrl+C to shut down.");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");

    facade.shutdown().await;
    drop(tokens);

    Ok(())
}
