//! Wire-protocol event definitions for the relay.
//!
//! The protocol is a closed set of tagged JSON messages, one variant per
//! event kind. Inbound frames outside the known set fail to decode and
//! are dropped at the connection layer; payload *contents* beyond the
//! envelope are deliberately not validated (a malformed market payload
//! is forwarded as-is).
//!
//! Field names on the wire stay camelCase for compatibility with the
//! upstream web application.

use chrono::{SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An event received from a client connection.
///
/// Envelope shape: `{"event": "<kind>", "data": {...}}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Control event: add this connection to the user's room.
    JoinUserRoom(RoomTarget),
    /// Control event: remove this connection from the user's room.
    LeaveUserRoom(RoomTarget),
    /// A financial transaction to fan out and persist.
    NewTransaction(Transaction),
    /// A balance change to fan out and persist last-value.
    UpdateBalance(BalanceChange),
    /// Global market data, forwarded to every open connection.
    MarketUpdate(Value),
    /// A user-directed notification, fan-out only.
    SendNotification(NotificationRequest),
}

impl ClientEvent {
    /// Event kind as a string label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            ClientEvent::JoinUserRoom(_) => "join_user_room",
            ClientEvent::LeaveUserRoom(_) => "leave_user_room",
            ClientEvent::NewTransaction(_) => "new_transaction",
            ClientEvent::UpdateBalance(_) => "update_balance",
            ClientEvent::MarketUpdate(_) => "market_update",
            ClientEvent::SendNotification(_) => "send_notification",
        }
    }
}

/// Payload of the room control events.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomTarget {
    pub user_id: String,
}

/// A transaction as submitted by a client.
///
/// Only the owning user id is interpreted; everything else is an
/// application-defined payload carried through untouched, both in
/// fan-out and in the persisted history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub user_id: String,
    #[serde(flatten)]
    pub details: serde_json::Map<String, Value>,
}

/// A balance update for one user.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChange {
    pub user_id: String,
    pub balance: Decimal,
}

/// A notification addressed to one user's room.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub user_id: String,
    /// Notification category; defaults to `info` when absent.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub message: String,
}

/// An event dispatched by the relay to client connections.
///
/// Every variant carries a server-stamped ISO-8601 timestamp added at
/// dispatch time; client-supplied timestamps are never echoed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    TransactionUpdate {
        #[serde(rename = "type")]
        kind: String,
        transaction: Transaction,
        timestamp: String,
    },
    BalanceUpdate {
        #[serde(rename = "type")]
        kind: String,
        balance: Decimal,
        timestamp: String,
    },
    MarketUpdate {
        #[serde(rename = "type")]
        kind: String,
        data: Value,
        timestamp: String,
    },
    Notification {
        #[serde(rename = "type")]
        kind: String,
        message: String,
        timestamp: String,
    },
}

impl ServerEvent {
    pub fn transaction(transaction: Transaction, timestamp: String) -> Self {
        Self::TransactionUpdate {
            kind: "new".to_string(),
            transaction,
            timestamp,
        }
    }

    pub fn balance(balance: Decimal, timestamp: String) -> Self {
        Self::BalanceUpdate {
            kind: "update".to_string(),
            balance,
            timestamp,
        }
    }

    pub fn market(data: Value, timestamp: String) -> Self {
        Self::MarketUpdate {
            kind: "update".to_string(),
            data,
            timestamp,
        }
    }

    pub fn notification(kind: Option<String>, message: String, timestamp: String) -> Self {
        Self::Notification {
            kind: kind.unwrap_or_else(|| "info".to_string()),
            message,
            timestamp,
        }
    }

    /// Event kind as a string label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            ServerEvent::TransactionUpdate { .. } => "transaction_update",
            ServerEvent::BalanceUpdate { .. } => "balance_update",
            ServerEvent::MarketUpdate { .. } => "market_update",
            ServerEvent::Notification { .. } => "notification",
        }
    }
}

/// Current time in the wire format, e.g. `2026-08-31T12:00:00.000Z`.
///
/// Millisecond precision with a `Z` suffix, matching what the upstream
/// application already parses.
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
