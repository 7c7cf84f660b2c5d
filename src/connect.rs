//! Connection establishment
//!
//! Supports both TLS and non-TLS connections based on URL parameters. The
//! session owns exactly one connection; the client half lives in a shared
//! slot so the lock subsystem can issue its protocol queries on the same
//! session (session-scoped lock rows are what make crash detection
//! automatic).

use std::sync::Arc;
use std::task::{Context, Poll};

use native_tls::TlsConnector;
use postgres_native_tls::{MakeTlsConnector, TlsStream};
use tokio::sync::RwLock;
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::{AsyncMessage, Client, NoTls, Socket};
use tracing::warn;

use crate::error::{Error, Result};

/// The session-owned connection slot.
///
/// Callers clone the `Arc<Client>` out and drop the guard before any round
/// trip; only reconnect and close write to the slot.
pub(crate) type SharedClient = Arc<RwLock<Option<Arc<Client>>>>;

/// Grab the live client, or fail when disconnected.
pub(crate) async fn current_client(slot: &SharedClient) -> Result<Arc<Client>> {
    slot.read().await.as_ref().cloned().ok_or(Error::NotConnected)
}

type TlsConnection = tokio_postgres::Connection<Socket, TlsStream<Socket>>;
type PlainConnection = tokio_postgres::Connection<Socket, NoTlsStream>;

/// A driver connection, TLS or not, with a unified message poll.
pub(crate) enum PgConnection {
    Tls(TlsConnection),
    Plain(PlainConnection),
}

impl PgConnection {
    pub(crate) fn poll_message(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<AsyncMessage, tokio_postgres::Error>>> {
        match self {
            PgConnection::Tls(conn) => conn.poll_message(cx),
            PgConnection::Plain(conn) => conn.poll_message(cx),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SslMode {
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    /// `sslmode` values as libpq spells them. Anything else is left for the
    /// driver to reject.
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "disable" => Some(SslMode::Disable),
            "allow" => Some(SslMode::Allow),
            "prefer" => Some(SslMode::Prefer),
            "require" => Some(SslMode::Require),
            "verify-ca" | "verify_ca" => Some(SslMode::VerifyCa),
            "verify-full" | "verify_full" => Some(SslMode::VerifyFull),
            _ => None,
        }
    }
}

/// Look up one parameter in the URL's pass-through bag. The whole bag still
/// reaches the driver untouched; this only peeks at the keys that steer the
/// connect path.
fn url_param<'a>(database_url: &'a str, name: &str) -> Option<&'a str> {
    let (_, query) = database_url.split_once('?')?;
    query
        .split('&')
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn sslmode_from_url(database_url: &str) -> Option<SslMode> {
    url_param(database_url, "sslmode").and_then(SslMode::parse)
}

async fn connect_tls(database_url: &str) -> Result<(Client, PgConnection)> {
    let connector = TlsConnector::builder().build()?;
    let tls = MakeTlsConnector::new(connector);
    let (client, connection) = tokio_postgres::connect(database_url, tls)
        .await
        .map_err(|source| Error::Connect { source })?;
    Ok((client, PgConnection::Tls(connection)))
}

async fn connect_plain(database_url: &str) -> Result<(Client, PgConnection)> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .map_err(|source| Error::Connect { source })?;
    Ok((client, PgConnection::Plain(connection)))
}

/// Connect honoring the URL's `sslmode`, defaulting to `prefer`.
pub(crate) async fn connect_with_sslmode(database_url: &str) -> Result<(Client, PgConnection)> {
    let sslmode = sslmode_from_url(database_url).unwrap_or(SslMode::Prefer);

    match sslmode {
        SslMode::Disable => connect_plain(database_url).await,
        SslMode::Allow => match connect_plain(database_url).await {
            Ok(pair) => Ok(pair),
            Err(plain_err) => {
                warn!(error = %plain_err, "non-TLS connection failed, trying TLS");
                connect_tls(database_url).await
            }
        },
        SslMode::Prefer => match connect_tls(database_url).await {
            Ok(pair) => Ok(pair),
            Err(tls_err) => {
                warn!(error = %tls_err, "TLS connection failed, trying non-TLS");
                connect_plain(database_url).await
            }
        },
        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
            connect_tls(database_url).await
        }
    }
}
