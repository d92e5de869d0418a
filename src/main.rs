use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};

use hublink::client::{ClientConfig, ConnectionEvent, ReliableConnection};
use hublink::config::{Settings, load_config};
use hublink::persistence::SledStorage;
use hublink::pool::{ConnectionPool, PoolConfig, StaticKeyAuthenticator};
use hublink::queue::{MessageQueue, QueueConfig};
use hublink::transport::start_websocket_server;
use hublink::utils::{Result, logging};

#[derive(Parser)]
#[command(name = "hublink", version, about = "Reliable hub <-> executor messaging over WebSockets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub and accept executor connections.
    Server,
    /// Connect to a hub as an executor.
    Client {
        /// Overrides `client.url`.
        #[arg(long)]
        url: Option<String>,
        /// Overrides `client.api_key`.
        #[arg(long)]
        api_key: Option<String>,
        /// Seconds between status reports.
        #[arg(long, default_value_t = 30)]
        status_every: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = load_config()?;
    logging::init(&settings.logging.level);

    match cli.command {
        Command::Server => run_server(settings).await,
        Command::Client {
            url,
            api_key,
            status_every,
        } => run_client(settings, url, api_key, Duration::from_secs(status_every.max(1))).await,
    }
}

async fn run_server(settings: Settings) -> Result<()> {
    let auth = StaticKeyAuthenticator::new(settings.pool.api_keys.clone());
    if auth.is_empty() {
        warn!("no API keys configured, every executor will be refused");
    }
    let pool = ConnectionPool::new(PoolConfig::from(&settings.pool), Arc::new(auth));
    pool.start();

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    tokio::select! {
        result = start_websocket_server(&addr, pool.clone()) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }
    pool.shutdown();
    Ok(())
}

async fn run_client(
    settings: Settings,
    url: Option<String>,
    api_key: Option<String>,
    status_every: Duration,
) -> Result<()> {
    let mut config = ClientConfig::from(&settings.client);
    if let Some(url) = url {
        config.url = url;
    }
    if api_key.is_some() {
        config.api_key = api_key;
    }

    let queue_config = QueueConfig::from(&settings.queue);
    let queue = if queue_config.persistence_enabled {
        let storage = SledStorage::open(&settings.queue.storage_path)?;
        MessageQueue::with_storage(queue_config, Box::new(storage))
    } else {
        MessageQueue::new(queue_config)
    };

    let conn = ReliableConnection::new(config, queue);
    let mut events = conn.events();
    let mut inbound = conn.messages();
    conn.connect().await?;

    let mut status = tokio::time::interval(status_every);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            _ = status.tick() => {
                let stats = conn.stats().await?;
                let report = json!({
                    "status": "alive",
                    "sent": stats.messages_sent,
                    "queued": stats.queue_len,
                });
                if !conn.send(report).await {
                    warn!("status report dropped");
                }
            }
            Ok(message) = inbound.recv() => {
                info!(message_id = %message.id, kind = ?message.kind, payload = %message.payload, "message from hub");
            }
            Ok(event) = events.recv() => {
                info!(?event, "connection event");
                if let ConnectionEvent::ConnectionFailed { reason, .. } = event {
                    error!(%reason, "connection failed permanently");
                    break;
                }
            }
        }
    }

    conn.disconnect().await;
    Ok(())
}
