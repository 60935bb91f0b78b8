//! Durable Event Log boundary.
//!
//! The store is an external collaborator with a narrow contract: a
//! capped per-key list for transaction history and a last-write-wins
//! cell per balance. [`EventStore`] captures that contract; the
//! built-in [`MemoryStore`] backend implements it in-process and a
//! networked backend plugs in behind the same trait.
//!
//! Persistence is fire-and-forget relative to fan-out: the router hands
//! writes to a [`StoreHandle`], which queues them for a background
//! writer task. A failed write is logged and dropped; it never stalls
//! or fails delivery to connected clients.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RelayConfig;

/// Errors from the Durable Event Log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown store backend: {0}")]
    UnknownBackend(String),

    #[error("store write failed: {0}")]
    WriteFailed(String),

    #[error("store read failed: {0}")]
    ReadFailed(String),
}

/// Narrow key-value contract the relay requires from its store.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Prepend `value` to the list at `key`, evicting the oldest
    /// entries beyond `cap`.
    async fn append_capped(&self, key: &str, value: String, cap: usize) -> Result<(), StoreError>;

    /// Overwrite the scalar cell at `key`.
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Read the scalar cell at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Read the list at `key`, most recent entry first.
    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Release any backing resources. Called once at shutdown.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Initialize the store backend selected by configuration.
pub fn init(config: &RelayConfig) -> Result<Arc<dyn EventStore>, StoreError> {
    match config.store_backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        other => Err(StoreError::UnknownBackend(other.to_string())),
    }
}

/// In-process store backend.
///
/// Stands in for the external key-value store in tests and single-node
/// demo deployments.
pub struct MemoryStore {
    lists: DashMap<String, VecDeque<String>>,
    cells: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            lists: DashMap::new(),
            cells: DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_capped(&self, key: &str, value: String, cap: usize) -> Result<(), StoreError> {
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_front(value);
        list.truncate(cap);
        Ok(())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.cells.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.cells.get(key).map(|cell| cell.clone()))
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

enum StoreCommand {
    AppendCapped {
        key: String,
        value: String,
        cap: usize,
    },
    Set {
        key: String,
        value: String,
    },
    /// Acknowledge once every prior command has been applied.
    Flush(oneshot::Sender<()>),
}

/// Non-blocking client for the background store writer.
///
/// Cheap to clone; all clones feed the same writer task. A disabled
/// handle (store unavailable at boot, degraded mode) silently drops
/// every write.
#[derive(Clone)]
pub struct StoreHandle {
    tx: Option<mpsc::UnboundedSender<StoreCommand>>,
}

impl StoreHandle {
    /// Handle that drops every write; used when the relay runs in
    /// fan-out-only mode.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue a capped-list append. Returns immediately.
    pub fn append_capped(&self, key: String, value: String, cap: usize) {
        self.send(StoreCommand::AppendCapped { key, value, cap });
    }

    /// Queue a scalar overwrite. Returns immediately.
    pub fn set(&self, key: String, value: String) {
        self.send(StoreCommand::Set { key, value });
    }

    /// Wait until every previously queued write has been applied.
    ///
    /// Used at shutdown and in tests; the dispatch path never calls it.
    pub async fn flush(&self) {
        if let Some(tx) = &self.tx {
            let (ack, done) = oneshot::channel();
            if tx.send(StoreCommand::Flush(ack)).is_ok() {
                let _ = done.await;
            }
        }
    }

    fn send(&self, command: StoreCommand) {
        if let Some(tx) = &self.tx {
            if tx.send(command).is_err() {
                warn!("store writer stopped, dropping write");
            }
        }
    }
}

/// Spawn the background writer that owns the store client.
///
/// The task drains queued writes until every [`StoreHandle`] clone is
/// dropped, then closes the store and exits.
pub fn spawn_writer(store: Arc<dyn EventStore>) -> (StoreHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                StoreCommand::AppendCapped { key, value, cap } => {
                    if let Err(error) = store.append_capped(&key, value, cap).await {
                        warn!(%key, %error, "dropped history append");
                    }
                }
                StoreCommand::Set { key, value } => {
                    if let Err(error) = store.set(&key, value).await {
                        warn!(%key, %error, "dropped cell write");
                    }
                }
                StoreCommand::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        if let Err(error) = store.close().await {
            warn!(%error, "event store close failed");
        } else {
            info!("event store closed");
        }
    });
    (StoreHandle { tx: Some(tx) }, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capped_list_evicts_oldest() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append_capped("transactions_u1", format!("tx{i}"), 3)
                .await
                .unwrap();
        }

        let entries = store.list("transactions_u1").await.unwrap();
        assert_eq!(entries, vec!["tx4", "tx3", "tx2"]);
    }

    #[tokio::test]
    async fn cell_is_last_write_wins() {
        let store = MemoryStore::new();
        store.set("balance_u1", "100".to_string()).await.unwrap();
        store.set("balance_u1", "250".to_string()).await.unwrap();

        assert_eq!(
            store.get("balance_u1").await.unwrap(),
            Some("250".to_string())
        );
    }

    #[tokio::test]
    async fn missing_keys_read_as_empty() {
        let store = MemoryStore::new();
        assert_eq!(store.get("balance_u1").await.unwrap(), None);
        assert!(store.list("transactions_u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writer_applies_queued_commands_in_order() {
        let store = Arc::new(MemoryStore::new());
        let (handle, _task) = spawn_writer(store.clone());

        handle.append_capped("transactions_u1".to_string(), "a".to_string(), 10);
        handle.append_capped("transactions_u1".to_string(), "b".to_string(), 10);
        handle.set("balance_u1".to_string(), "42".to_string());
        handle.flush().await;

        assert_eq!(store.list("transactions_u1").await.unwrap(), vec!["b", "a"]);
        assert_eq!(
            store.get("balance_u1").await.unwrap(),
            Some("42".to_string())
        );
    }

    #[tokio::test]
    async fn writer_exits_when_handles_drop() {
        let store = Arc::new(MemoryStore::new());
        let (handle, task) = spawn_writer(store);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn disabled_handle_drops_writes_silently() {
        let handle = StoreHandle::disabled();
        assert!(!handle.is_enabled());
        handle.set("balance_u1".to_string(), "1".to_string());
        handle.flush().await; // must not hang
    }

    #[test]
    fn unknown_backend_is_an_init_error() {
        let config = RelayConfig {
            store_backend: "redis".to_string(),
            ..RelayConfig::default()
        };
        assert_eq!(
            init(&config).err(),
            Some(StoreError::UnknownBackend("redis".to_string()))
        );
    }
}
