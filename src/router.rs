//! Event dispatch: fan-out targets and persistence per event kind.
//!
//! One dispatch table drives the router:
//!
//! | inbound           | targets                      | persisted as            |
//! |-------------------|------------------------------|-------------------------|
//! | new_transaction   | sender's room, minus sender  | capped history append   |
//! | update_balance    | sender's room, minus sender  | last-value cell         |
//! | market_update     | every connection, sender too | nothing                 |
//! | send_notification | target room, minus sender    | nothing                 |
//!
//! Room control events never reach the router; the connection layer
//! hands them to the registry directly.
//!
//! Every outbound event is stamped with the dispatch-time timestamp.
//! Persistence goes through the store writer channel and is never
//! awaited here, so a slow or failing store cannot stall delivery.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::events::{iso_timestamp, ClientEvent, ServerEvent};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::store::StoreHandle;

/// Routes inbound events to rooms and to the durable log.
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    store: StoreHandle,
    history_cap: usize,
}

impl EventRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, store: StoreHandle, history_cap: usize) -> Self {
        Self {
            registry,
            store,
            history_cap,
        }
    }

    /// Dispatch one inbound event from `origin`.
    ///
    /// Never fails: a bad event is logged and dropped, and persistence
    /// problems are invisible to the dispatch path.
    pub fn dispatch(&self, origin: ConnectionId, event: ClientEvent) {
        debug!(connection_id = %origin, event = event.label(), "dispatching");
        match event {
            // Control events are the registry's job; nothing to route.
            ClientEvent::JoinUserRoom(_) | ClientEvent::LeaveUserRoom(_) => {}
            ClientEvent::NewTransaction(transaction) => {
                if transaction.user_id.is_empty() {
                    warn!(connection_id = %origin, "dropping transaction without user id");
                    return;
                }
                match serde_json::to_string(&transaction) {
                    Ok(raw) => self.store.append_capped(
                        format!("transactions_{}", transaction.user_id),
                        raw,
                        self.history_cap,
                    ),
                    Err(error) => {
                        warn!(connection_id = %origin, %error, "transaction not persisted")
                    }
                }
                let user_id = transaction.user_id.clone();
                let outbound = ServerEvent::transaction(transaction, iso_timestamp());
                self.fan_out_room(&user_id, origin, &outbound);
            }
            ClientEvent::UpdateBalance(change) => {
                if change.user_id.is_empty() {
                    warn!(connection_id = %origin, "dropping balance update without user id");
                    return;
                }
                self.store.set(
                    format!("balance_{}", change.user_id),
                    change.balance.to_string(),
                );
                let outbound = ServerEvent::balance(change.balance, iso_timestamp());
                self.fan_out_room(&change.user_id, origin, &outbound);
            }
            ClientEvent::MarketUpdate(data) => {
                // Payload shape is not validated; forwarded as-is.
                let outbound = ServerEvent::market(data, iso_timestamp());
                self.fan_out_all(&outbound);
            }
            ClientEvent::SendNotification(request) => {
                if request.user_id.is_empty() {
                    warn!(connection_id = %origin, "dropping notification without user id");
                    return;
                }
                let outbound =
                    ServerEvent::notification(request.kind, request.message, iso_timestamp());
                self.fan_out_room(&request.user_id, origin, &outbound);
            }
        }
    }

    fn fan_out_room(&self, user_id: &str, origin: ConnectionId, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(frame) => {
                let delivered = self.registry.fan_out_room(user_id, Some(origin), &frame);
                debug!(event = event.label(), user_id, delivered, "room fan-out");
            }
            Err(error) => warn!(event = event.label(), %error, "encode failed"),
        }
    }

    fn fan_out_all(&self, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(frame) => {
                let delivered = self.registry.fan_out_all(&frame);
                debug!(event = event.label(), delivered, "global fan-out");
            }
            Err(error) => warn!(event = event.label(), %error, "encode failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{spawn_writer, EventStore, MemoryStore};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        router: EventRouter,
        store: Arc<MemoryStore>,
        handle: StoreHandle,
    }

    fn harness(history_cap: usize) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let (handle, _task) = spawn_writer(store.clone());
        let router = EventRouter::new(registry.clone(), handle.clone(), history_cap);
        Harness {
            registry,
            router,
            store,
            handle,
        }
    }

    fn connect(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id, tx);
        (id, rx)
    }

    fn inbound(raw: &str) -> ClientEvent {
        serde_json::from_str(raw).unwrap()
    }

    fn received(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn transaction_reaches_room_but_not_sender() {
        let h = harness(1000);
        let (sender, mut sender_rx) = connect(&h.registry);
        let (peer, mut peer_rx) = connect(&h.registry);
        h.registry.join(sender, "u1").unwrap();
        h.registry.join(peer, "u1").unwrap();

        h.router.dispatch(
            sender,
            inbound(r#"{"event":"new_transaction","data":{"userId":"u1","amount":50}}"#),
        );

        let event = received(&mut peer_rx);
        assert_eq!(event["event"], "transaction_update");
        assert_eq!(event["data"]["type"], "new");
        assert_eq!(event["data"]["transaction"]["amount"], 50);
        assert_eq!(event["data"]["transaction"]["userId"], "u1");
        assert!(event["data"]["timestamp"].is_string());
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transaction_is_persisted_under_user_key() {
        let h = harness(1000);
        let (sender, _rx) = connect(&h.registry);
        h.registry.join(sender, "u1").unwrap();

        h.router.dispatch(
            sender,
            inbound(r#"{"event":"new_transaction","data":{"userId":"u1","amount":50}}"#),
        );
        h.handle.flush().await;

        let entries = h.store.list("transactions_u1").await.unwrap();
        assert_eq!(entries.len(), 1);
        let stored: Value = serde_json::from_str(&entries[0]).unwrap();
        assert_eq!(stored, json!({"userId": "u1", "amount": 50}));
    }

    #[tokio::test]
    async fn transaction_history_respects_cap() {
        let h = harness(1000);
        let (sender, _rx) = connect(&h.registry);

        for i in 0..1001 {
            h.router.dispatch(
                sender,
                inbound(&format!(
                    r#"{{"event":"new_transaction","data":{{"userId":"u2","amount":{i}}}}}"#
                )),
            );
        }
        h.handle.flush().await;

        let entries = h.store.list("transactions_u2").await.unwrap();
        assert_eq!(entries.len(), 1000);
        // Most recent first; the oldest entry (amount 0) was evicted.
        let newest: Value = serde_json::from_str(&entries[0]).unwrap();
        assert_eq!(newest["amount"], 1000);
        let oldest: Value = serde_json::from_str(&entries[999]).unwrap();
        assert_eq!(oldest["amount"], 1);
    }

    #[tokio::test]
    async fn persistence_happens_even_with_empty_room() {
        let h = harness(1000);
        let (sender, _rx) = connect(&h.registry);
        // Sender addresses a room nobody is in, itself included.

        h.router.dispatch(
            sender,
            inbound(r#"{"event":"new_transaction","data":{"userId":"ghost","amount":1}}"#),
        );
        h.handle.flush().await;

        assert_eq!(h.store.list("transactions_ghost").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn balance_update_overwrites_cell() {
        let h = harness(1000);
        let (sender, _rx) = connect(&h.registry);
        let (peer, mut peer_rx) = connect(&h.registry);
        h.registry.join(sender, "u1").unwrap();
        h.registry.join(peer, "u1").unwrap();

        h.router.dispatch(
            sender,
            inbound(r#"{"event":"update_balance","data":{"userId":"u1","balance":100}}"#),
        );
        h.router.dispatch(
            sender,
            inbound(r#"{"event":"update_balance","data":{"userId":"u1","balance":250.5}}"#),
        );
        h.handle.flush().await;

        assert_eq!(
            h.store.get("balance_u1").await.unwrap(),
            Some("250.5".to_string())
        );
        let first = received(&mut peer_rx);
        assert_eq!(first["event"], "balance_update");
        assert_eq!(first["data"]["type"], "update");
        let second = received(&mut peer_rx);
        assert_eq!(second["data"]["balance"], "250.5");
    }

    #[tokio::test]
    async fn market_update_reaches_every_connection_including_sender() {
        let h = harness(1000);
        let (sender, mut sender_rx) = connect(&h.registry);
        let (a, mut a_rx) = connect(&h.registry);
        let (_b, mut b_rx) = connect(&h.registry);
        h.registry.join(a, "u1").unwrap();

        h.router.dispatch(
            sender,
            inbound(r#"{"event":"market_update","data":{"price":100}}"#),
        );
        h.handle.flush().await;

        for rx in [&mut sender_rx, &mut a_rx, &mut b_rx] {
            let event = received(rx);
            assert_eq!(event["event"], "market_update");
            assert_eq!(event["data"]["data"]["price"], 100);
        }
        // Market data is never persisted.
        assert!(h.store.list("transactions_u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn notification_defaults_type_and_excludes_sender() {
        let h = harness(1000);
        let (sender, mut sender_rx) = connect(&h.registry);
        let (peer, mut peer_rx) = connect(&h.registry);
        h.registry.join(sender, "u1").unwrap();
        h.registry.join(peer, "u1").unwrap();

        h.router.dispatch(
            sender,
            inbound(r#"{"event":"send_notification","data":{"userId":"u1","message":"hi"}}"#),
        );

        let event = received(&mut peer_rx);
        assert_eq!(event["event"], "notification");
        assert_eq!(event["data"]["type"], "info");
        assert_eq!(event["data"]["message"], "hi");
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn notification_to_departed_connection_is_silent() {
        let h = harness(1000);
        let (gone, gone_rx) = connect(&h.registry);
        let (sender, _rx) = connect(&h.registry);
        h.registry.join(gone, "u1").unwrap();
        h.registry.join(sender, "u1").unwrap();
        drop(gone_rx);
        h.registry.on_disconnect(gone);

        h.router.dispatch(
            sender,
            inbound(r#"{"event":"send_notification","data":{"userId":"u1","message":"hi"}}"#),
        );

        assert!(h.registry.members_of("u1").contains(&sender));
        assert!(!h.registry.members_of("u1").contains(&gone));
    }

    #[tokio::test]
    async fn events_without_user_id_are_dropped() {
        let h = harness(1000);
        let (sender, _rx) = connect(&h.registry);
        let (_peer, mut peer_rx) = connect(&h.registry);

        h.router.dispatch(
            sender,
            inbound(r#"{"event":"new_transaction","data":{"userId":"","amount":1}}"#),
        );
        h.handle.flush().await;

        assert!(peer_rx.try_recv().is_err());
        assert!(h.store.list("transactions_").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_store_still_fans_out() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = EventRouter::new(registry.clone(), StoreHandle::disabled(), 1000);
        let (sender, _rx) = connect(&registry);
        let (peer, mut peer_rx) = connect(&registry);
        registry.join(sender, "u1").unwrap();
        registry.join(peer, "u1").unwrap();

        router.dispatch(
            sender,
            inbound(r#"{"event":"new_transaction","data":{"userId":"u1","amount":5}}"#),
        );

        let event = received(&mut peer_rx);
        assert_eq!(event["event"], "transaction_update");
    }
}
