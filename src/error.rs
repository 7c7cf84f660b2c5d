//! Error taxonomy
//!
//! Connection-level failures (refused connects, mid-stream disconnects) are
//! reported through session events and handled by the reconnect machinery;
//! operation-level failures surface to the caller through these types.

use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong inside a pub/sub session.
#[derive(Debug, Error)]
pub enum Error {
    /// The driver refused the connection.
    #[error("connection failed: {source}")]
    Connect {
        #[source]
        source: tokio_postgres::Error,
    },

    /// Reconnect attempts reached the configured limit. Terminal for the
    /// session: one `Error` event carries this, followed by `Closed`.
    #[error("connect failed after {attempts} retries")]
    RetryExhausted { attempts: u32 },

    /// The database rejected lock-subsystem initialization.
    #[error("lock setup failed for channel {channel:?}: {source}")]
    LockSetup {
        channel: String,
        #[source]
        source: tokio_postgres::Error,
    },

    /// Any other database failure during a public operation.
    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// A notification payload was not valid JSON. The malformed message is
    /// reported, never dispatched.
    #[error("malformed payload on channel {channel:?}: {source}")]
    Decode {
        channel: String,
        payload: String,
        #[source]
        source: serde_json::Error,
    },

    /// The TLS connector could not be built.
    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    /// The session has no live connection.
    #[error("not connected")]
    NotConnected,

    /// The channel name has the `__<name>__lock__` shape reserved for the
    /// lock protocol.
    #[error("channel name {channel:?} is reserved for the lock protocol")]
    ReservedChannel { channel: String },

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
