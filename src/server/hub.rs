use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::connection::{ConnId, ConnectionHandle};
use crate::error::HubError;

pub enum HubCommand {
    Register(ConnectionHandle),
    Unregister(ConnId),
    Broadcast(String),
    Count(oneshot::Sender<usize>),
}

/// Sending side of the hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub async fn register(&self, conn: ConnectionHandle) -> Result<(), HubError> {
        self.send(HubCommand::Register(conn)).await
    }

    pub async fn unregister(&self, id: ConnId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister(id)).await
    }

    pub async fn broadcast_all(&self, frame: String) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast(frame)).await
    }

    pub async fn count(&self) -> Result<usize, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Count(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.tx.send(cmd).await.map_err(|_| HubError::Closed)
    }
}

/// Owner of the registered-connection set. Only this task adds to or
/// removes from it.
pub struct Hub {
    rx: mpsc::Receiver<HubCommand>,
    clients: HashMap<ConnId, ConnectionHandle>,
}

impl Hub {
    pub fn new(capacity: usize) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                rx,
                clients: HashMap::new(),
            },
            HubHandle { tx },
        )
    }

    /// Runs until every handle is gone. The hub never exits on its own, so
    /// a return is always `Err` and callers treat it as fatal.
    pub async fn run(mut self) -> Result<(), HubError> {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                HubCommand::Register(handle) => self.register(handle),
                HubCommand::Unregister(id) => self.unregister(id),
                HubCommand::Broadcast(frame) => self.broadcast(frame),
                HubCommand::Count(reply) => {
                    let _ = reply.send(self.clients.len());
                }
            }
        }
        Err(HubError::Closed)
    }

    fn register(&mut self, handle: ConnectionHandle) {
        let total = self.clients.len() + 1;
        info!(conn = %handle.id, peer = %handle.peer, total, "hub +client");
        self.clients.insert(handle.id, handle);
    }

    fn unregister(&mut self, id: ConnId) {
        if let Some(handle) = self.clients.remove(&id) {
            handle.close();
            info!(conn = %id, peer = %handle.peer, total = self.clients.len(), "hub -client");
        }
    }

    fn broadcast(&mut self, frame: String) {
        let mut to_remove = Vec::new();
        for (id, handle) in &self.clients {
            if handle.send(frame.clone()).is_err() {
                warn!(conn = %id, "dropped slow client");
                to_remove.push(*id);
            }
        }
        for id in to_remove {
            self.unregister(id);
        }
    }
}
