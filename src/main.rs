use anyhow::Result;
use std::collections::BTreeSet;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use urlcast::config::{ChannelConfig, TransportMode};
use urlcast::connection::{ConnectionEvent, ConnectionManager, EventReceiver};
use urlcast::transport::{RfcommConnector, TcpConnector, TransportConnector};

const DEFAULT_CONFIG_PATH: &str = "urlcast.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = ChannelConfig::load_or_default(&path)?;

    info!("urlcast starting");
    info!("  Endpoint: {}", config.endpoint);
    info!("  Transport: {:?}", config.transport.mode);

    match config.transport.mode {
        TransportMode::Rfcomm => {
            let connector =
                RfcommConnector::from_endpoint(&config.endpoint, config.transport.channel)?;
            run(connector, config).await
        }
        TransportMode::Tcp => {
            let connector = TcpConnector::new(config.endpoint.clone());
            run(connector, config).await
        }
    }
}

/// Submit every stdin line and exit once all of them are delivered
async fn run<C: TransportConnector>(connector: C, config: ChannelConfig) -> Result<()> {
    let (manager, mut events) = ConnectionManager::new(connector, config);
    manager.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut outstanding = BTreeSet::new();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if !stdin_open && outstanding.is_empty() {
            info!("All URLs delivered");
            break;
        }

        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    let url = line.trim();
                    if url.is_empty() {
                        continue;
                    }
                    match manager.submit(url) {
                        Ok(seq) => {
                            debug!("Queued #{}: {}", seq, url);
                            outstanding.insert(seq);
                        }
                        Err(e) => error!("Rejected {}: {}", url, e),
                    }
                }
                None => {
                    debug!("stdin closed, {} URL(s) outstanding", outstanding.len());
                    stdin_open = false;
                }
            },
            event = events.recv() => match event {
                Some(event) => log_event(&event, &mut outstanding),
                None => break,
            },
            _ = &mut ctrl_c => {
                warn!("Interrupted, {} URL(s) undelivered", outstanding.len());
                break;
            }
        }
    }

    manager.close().await;
    drain_events(&mut events, &mut outstanding);
    Ok(())
}

fn drain_events(events: &mut EventReceiver, outstanding: &mut BTreeSet<u64>) {
    while let Ok(event) = events.try_recv() {
        log_event(&event, outstanding);
    }
}

fn log_event(event: &ConnectionEvent, outstanding: &mut BTreeSet<u64>) {
    match event {
        ConnectionEvent::Connected { endpoint, session } => {
            info!("Connected to {} (session {})", endpoint, session);
        }
        ConnectionEvent::Disconnected { reason } => {
            warn!("Disconnected: {}", reason);
        }
        ConnectionEvent::Reconnecting { attempt, delay } => {
            info!("Reconnect attempt {} in {:?}", attempt, delay);
        }
        ConnectionEvent::ConnectFailed { attempt, reason } => {
            warn!("Connect attempt {} failed: {}", attempt, reason);
        }
        ConnectionEvent::SendSucceeded { seq } => {
            // Delivery is in order, so anything older made it too
            *outstanding = outstanding.split_off(&(seq + 1));
            info!("Delivered #{}", seq);
        }
        ConnectionEvent::SendFailed { seq, reason } => {
            warn!("Send #{} failed: {}", seq, reason);
        }
        ConnectionEvent::Received(payload) => {
            debug!("Received {} bytes from peer", payload.len());
        }
    }
}
