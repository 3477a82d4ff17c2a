//! Append-only audit trail of every command the hub answers.
//!
//! Records go through a bounded channel to a single worker task, so a burst
//! of commands never fans out into unbounded logging work. When the channel
//! is full the record is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::model::{Account, Device};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub conn: u64,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub device: Device,
    #[serde(rename = "transactionID")]
    pub transaction_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub conn: u64,
    pub command: i32,
    #[serde(rename = "transactionID")]
    pub transaction_id: String,
    pub result_code: i32,
    pub detail: String,
    pub account: Option<Account>,
    pub device: Option<Device>,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditRecord>,
    dropped: Arc<AtomicU64>,
}

impl AuditLog {
    /// Creates the log and hands back the receiving end for whoever drains it.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AuditRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Creates the log with a worker that writes each record on the `audit`
    /// tracing target.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (log, rx) = Self::channel(capacity);
        (log, tokio::spawn(run_writer(rx)))
    }

    pub fn record(&self, record: AuditRecord) {
        if self.tx.try_send(record).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped = n, "audit queue full, record dropped");
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run_writer(mut rx: mpsc::Receiver<AuditRecord>) {
    while let Some(record) = rx.recv().await {
        match serde_json::to_string(&record) {
            Ok(line) => info!(
                target: "audit",
                conn = record.conn,
                command = record.command,
                result = record.result_code,
                "{line}"
            ),
            Err(e) => warn!(error = %e, "audit record not serializable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(conn: u64) -> AuditRecord {
        AuditRecord {
            at: Utc::now(),
            conn,
            command: 9,
            transaction_id: "t".into(),
            result_code: 0,
            detail: String::new(),
            account: None,
            device: None,
            sessions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let (log, mut rx) = AuditLog::channel(1);
        log.record(record(1));
        log.record(record(2));
        assert_eq!(log.dropped(), 1);
        assert_eq!(rx.recv().await.unwrap().conn, 1);
    }

    #[test]
    fn redacts_account_secrets() {
        let mut account = Account::new("u1");
        account.password_hash = "deadbeef".into();
        let mut r = record(1);
        r.account = Some(account);
        let text = serde_json::to_string(&r).unwrap();
        assert!(!text.contains("deadbeef"));
        assert!(text.contains("\"userID\":\"u1\""));
    }
}
