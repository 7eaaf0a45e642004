mod session;

use anyhow::Result;
use session::PeerSession;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use urlcast_shared::defaults::TCP_SIMULATION_ADDR;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9000";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!("[RECV] Listening on {} (senders default to {})", addr, TCP_SIMULATION_ADDR);

    loop {
        let (socket, peer) = listener.accept().await?;
        info!("[RECV] Connection from {}", peer);

        tokio::spawn(async move {
            let mut session = PeerSession::new(socket, peer.to_string());
            loop {
                match session.recv().await {
                    Ok(Some(url)) => info!("[RECV] {}: {}", session.peer(), url),
                    Ok(None) => {
                        info!(
                            "[RECV] {} disconnected after {:?}",
                            session.peer(),
                            session.connected_at().elapsed()
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(
                            "[RECV] Dropping {} (last frame {:?} ago): {}",
                            session.peer(),
                            session.last_seen().elapsed(),
                            e
                        );
                        break;
                    }
                }
            }
            debug!("[RECV] {} sent {} heartbeat(s)", session.peer(), session.heartbeats());
        });
    }
}
