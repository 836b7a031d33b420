//! Accept loop: binds the TCP port, spawns one independent task per socket
//! (component E). Shutdown stops accepting; live sessions are drained by
//! the shutdown coordinator (§4.10).

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::connection::Connection;
use crate::metrics::Metrics;
use crate::persistence::Persistence;
use crate::registry::Registry;
use crate::shutdown::ShutdownCoordinator;

pub async fn run<P: Persistence + 'static>(
    config: Arc<Config>,
    persistence: Arc<P>,
    registry: Registry,
    broadcaster: Broadcaster,
    metrics: Arc<Metrics>,
    shutdown: ShutdownCoordinator,
) {
    let addr = config.tcp_addr();
    let listener = TcpListener::bind(&addr).await.unwrap_or_else(|err| {
        error!(addr = %addr, error = %err, "failed to bind TCP listener");
        std::process::exit(1);
    });
    info!(addr = %addr, "TCP listener bound");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer_addr)) => {
                        if let Err(err) = socket.set_nodelay(true) {
                            warn!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
                        }
                        Connection::spawn(
                            socket,
                            peer_addr,
                            persistence.clone(),
                            registry.clone(),
                            broadcaster.clone(),
                            config.clone(),
                            metrics.clone(),
                        );
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                    }
                }
            }
            _ = shutdown.triggered() => {
                info!("listener stopping accept loop");
                return;
            }
        }
    }
}
