//! WebSocket listener that attaches dashboard subscribers to the hub.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use crate::HubError;
use crate::hub::HubHandle;
use crate::session::spawn_session;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

/// Accepts subscriber sockets and hands each one to a session.
pub struct SubscriberServer {
    config: ServerConfig,
    hub: HubHandle,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl SubscriberServer {
    pub fn new(config: ServerConfig, hub: HubHandle) -> Arc<Self> {
        Arc::new(Self {
            config,
            hub,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Stops accepting. Established sessions end when the hub closes
    /// their mailboxes.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds and accepts until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), HubError> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("subscriber server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("subscriber server shutting down");
                    break Ok(());
                }

                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        let server = Arc::clone(self);
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                tracing::warn!(%peer_addr, "subscriber connection error: {e}");
                            }
                        });
                    }
                    Err(e) => tracing::error!("accept error: {e}"),
                },
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), HubError> {
        let max_read = self.hub.config().max_read_size;
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(max_read);
        ws_config.max_frame_size = Some(max_read);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let mailbox = self.hub.register()?;
        tracing::info!(%peer_addr, subscriber = %mailbox.id(), "subscriber connected");
        spawn_session(ws_stream, mailbox, self.hub.clone(), peer_addr.to_string());
        Ok(())
    }
}
