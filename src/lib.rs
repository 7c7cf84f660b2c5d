//! pgcast - Reliable pub/sub over PostgreSQL LISTEN/NOTIFY
//!
//! A pub/sub client that rides PostgreSQL's native notification primitive:
//! subscribe to named channels, receive JSON payloads published by any
//! database session, and survive disconnects transparently. In
//! single-listener mode an arbitrary number of competing processes
//! coordinate through the database itself so exactly one of them is the
//! live consumer of each channel; when it dies or disconnects, a waiting
//! peer takes over automatically.
//!
//! ## Architecture
//!
//! ```text
//! NOTIFY (any session) → Postgres → driver task → router ─┬→ session events
//!                                       │                 └→ per-channel events
//!                                       └→ __chan__lock__ → channel lock
//! ```
//!
//! Three pieces compose: a [`ChannelLock`] per channel (a distributed mutex
//! backed by a tracking row, with peer liveness read from
//! `pg_stat_activity`), the notification router (which consumes the lock
//! protocol's reserved `__<name>__lock__` traffic and fans application
//! messages out), and the [`PgPubSub`] session (one connection, the tracked
//! channel set, and the reconnect state machine).
//!
//! Delivery follows the database's semantics: only currently connected
//! listeners receive a notification; missed messages are gone. What this
//! crate adds is the rebuild - after any disconnect the session re-listens
//! every tracked channel, re-running lock acquisition for each.
//!
//! ## Example
//!
//! ```ignore
//! use pgcast::{PgPubSub, PubSubConfig, SessionEvent};
//!
//! let bus = PgPubSub::new(PubSubConfig::new("postgres://localhost/app"));
//! bus.connect().await?;
//!
//! let mut events = bus.events();
//! bus.listen("jobs").await?;
//!
//! bus.notify("jobs", &serde_json::json!({"id": 1})).await?;
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::Message { channel, payload } = event {
//!         println!("{channel}: {payload}");
//!     }
//! }
//! ```

pub mod config;
mod connect;
pub mod error;
pub mod events;
mod lock;
pub mod payload;
mod router;
pub mod session;

pub use config::{ConfigError, PubSubConfig};
pub use error::{Error, Result};
pub use events::SessionEvent;
pub use lock::ChannelLock;
pub use session::{PgPubSub, SessionState};
