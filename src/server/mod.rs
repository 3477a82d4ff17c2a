pub mod broadcast;
pub mod commands;
pub mod connection;
pub mod hub;
pub mod registry;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::auth::{Mailer, TokenService};
use crate::config::Config;
use crate::error::HubError;
use crate::protocol::{Notice, Outbound, RESULT_OK};
use crate::store::Persistence;
use connection::{ConnId, ConnectionHandle};
use hub::{Hub, HubHandle};
use registry::SessionRegistry;

type WsStream = WebSocketStream<TcpStream>;

// Stand-in deadline when the idle watchdog is off; the branch is disabled anyway.
const NO_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How long a closing connection may take to flush its queue and close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub struct Server {
    config: Config,
    registry: SessionRegistry,
    hub: HubHandle,
    store: Arc<dyn Persistence>,
    mailer: Arc<dyn Mailer>,
    tokens: TokenService,
    audit: AuditLog,
    conn_counter: AtomicU64,
}

impl Server {
    /// Assembles a server around an already running hub and audit log.
    pub fn new(
        config: Config,
        store: Arc<dyn Persistence>,
        mailer: Arc<dyn Mailer>,
        hub: HubHandle,
        audit: AuditLog,
    ) -> Self {
        let tokens = TokenService::new(config.token_secret.as_bytes(), config.token_ttl_secs);
        Self {
            config,
            registry: SessionRegistry::new(),
            hub,
            store,
            mailer,
            tokens,
            audit,
            conn_counter: AtomicU64::new(0),
        }
    }

    /// Spawns the hub and the audit writer and returns the server with the
    /// hub's task. The hub finishing means the server can no longer route
    /// anything; callers should treat it as fatal.
    pub fn start(
        config: Config,
        store: Arc<dyn Persistence>,
        mailer: Arc<dyn Mailer>,
    ) -> (Arc<Self>, JoinHandle<Result<(), HubError>>) {
        let (hub, hub_handle) = Hub::new(config.hub_buffer);
        let hub_task = tokio::spawn(hub.run());
        let (audit, _writer) = AuditLog::spawn(config.audit_buffer);
        let srv = Arc::new(Self::new(config, store, mailer, hub_handle, audit));
        (srv, hub_task)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub async fn listen_and_serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let srv = self.clone();
                    tokio::spawn(srv.serve_conn(stream, peer));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Tells every registered connection something, e.g. before shutdown.
    pub async fn notify_all(&self, text: &str) -> Result<(), HubError> {
        match Outbound::notice(Notice::ServerNotice).with_results(text).encode() {
            Ok(frame) => self.hub.broadcast_all(frame).await,
            Err(e) => {
                warn!(error = %e, "encoding server notice failed");
                Ok(())
            }
        }
    }

    async fn serve_conn(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%peer, error = %e, "websocket upgrade failed");
                return;
            }
        };

        let id = ConnId(self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1);
        let (handle, send_rx) =
            ConnectionHandle::channel(id, peer.to_string(), self.config.send_buffer);
        if let Err(e) = self.hub.register(handle.clone()).await {
            error!(conn = %id, error = %e, "hub unavailable, dropping connection");
            return;
        }

        let (sink, stream) = ws.split();
        let writer = tokio::spawn(write_pump(sink, send_rx, handle.clone()));

        self.read_pump(stream, &handle).await;
        self.release(&handle).await;

        if let Err(e) = writer.await {
            warn!(conn = %id, error = %e, "write pump panicked");
        }
        debug!(conn = %id, %peer, "connection closed");
    }

    async fn read_pump(&self, mut stream: SplitStream<WsStream>, handle: &ConnectionHandle) {
        let idle = self.config.idle_timeout();
        let deadline = tokio::time::sleep(idle.unwrap_or(NO_DEADLINE));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = handle.closed() => break,
                _ = &mut deadline, if idle.is_some() => {
                    self.expire_idle(handle).await;
                    break;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_text(handle, &text).await {
                            if let Some(d) = idle {
                                deadline.as_mut().reset(Instant::now() + d);
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => self.reject_binary(handle).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(conn = %handle.id, error = %e, "read failed");
                        break;
                    }
                }
            }
        }
    }

    /// Idle watchdog fired: force the device offline and tell its area.
    async fn expire_idle(&self, handle: &ConnectionHandle) {
        info!(conn = %handle.id, peer = %handle.peer, "idle timeout");
        let notice = Outbound::notice(Notice::ServerNotice).with_results("idle timeout");
        let _ = handle.send_message(&notice);

        if let Some(session) = self.registry.remove(handle.id).await {
            let areas = session.effective_area().to_vec();
            let n = self.registry.announce_area(&areas, Some(handle.id)).await;
            let caller = Some((session.account, session.device));
            self.audit_event(
                handle.id,
                0,
                "",
                RESULT_OK,
                format!("idle timeout; forced offline; area {areas:?} notified ({n})"),
                caller,
            )
            .await;
        }
    }

    /// Tear-down for a connection whose read side has ended.
    async fn release(&self, handle: &ConnectionHandle) {
        if let Some(session) = self.registry.remove(handle.id).await {
            info!(
                conn = %handle.id,
                user_id = %session.account.user_id,
                device = %session.device.key(),
                "bound connection dropped"
            );
            self.registry
                .announce_area(session.effective_area(), Some(handle.id))
                .await;
        }
        if let Err(e) = self.hub.unregister(handle.id).await {
            error!(conn = %handle.id, error = %e, "unregister failed");
        }
        handle.close();
    }
}

/// Drains the outbound queue onto the socket. A close interrupts a send
/// that is stuck on a peer that stopped reading. Whatever is still queued
/// then gets [`CLOSE_GRACE`] to go out with the close frame, and the sink
/// is dropped either way.
async fn write_pump(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<String>,
    handle: ConnectionHandle,
) {
    loop {
        let text = tokio::select! {
            biased;
            _ = handle.closed() => break,
            frame = rx.recv() => match frame {
                Some(text) => text,
                None => break,
            },
        };
        let sent = tokio::select! {
            _ = handle.closed() => break,
            res = sink.send(Message::Text(text)) => res,
        };
        if let Err(e) = sent {
            warn!(conn = %handle.id, error = %e, "write failed");
            handle.close();
            return;
        }
    }

    let flush = async {
        while let Ok(text) = rx.try_recv() {
            sink.send(Message::Text(text)).await?;
        }
        sink.send(Message::Close(None)).await
    };
    match tokio::time::timeout(CLOSE_GRACE, flush).await {
        Ok(Ok(())) => debug!(conn = %handle.id, "write pump ended"),
        Ok(Err(e)) => debug!(conn = %handle.id, error = %e, "close not delivered"),
        Err(_) => warn!(conn = %handle.id, "peer not reading, dropping socket"),
    }
}
