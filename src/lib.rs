//! Notification Relay Service
//!
//! Accepts many concurrent WebSocket connections, groups them into
//! per-user broadcast rooms, fans financial events out between clients,
//! and appends a capped history of transactions to a durable event log.
//!
//! The relay never originates business data itself: an upstream
//! application authenticates users and performs all account CRUD before
//! a client ever connects here.
//!
//! # Architecture
//!
//! ```text
//!  WebSocket clients
//!        │
//!    ┌───▼────┐
//!    │ Server │  ← accepts connections, decodes the wire protocol
//!    └───┬────┘
//!        │
//!   ┌────┴─────────┐
//!   │              │
//! ┌─▼───────┐  ┌───▼────┐
//! │Registry │◄─┤ Router │  ← rooms + fan-out per the dispatch table
//! └─────────┘  └───┬────┘
//!                  │ fire-and-forget
//!             ┌────▼─────┐
//!             │  Store   │  ← capped transaction log, balance cells
//!             └──────────┘
//! ```

pub mod config;
pub mod events;
pub mod registry;
pub mod router;
pub mod server;
pub mod store;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
