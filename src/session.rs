//! The pub/sub session
//!
//! Owns the single database connection, the tracked-channel map, and the
//! reconnect state machine. Channel subscriptions are rebuilt from local
//! state after every reconnect, so the subscription set survives any number
//! of `live -> disconnected -> live` cycles.

use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::time;
use tokio_postgres::AsyncMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PubSubConfig;
use crate::connect::{self, current_client, PgConnection, SharedClient};
use crate::error::{Error, Result};
use crate::events::{EventHub, SessionEvent};
use crate::lock::{self, ChannelLock};
use crate::payload::{self, quote_ident, quote_literal};
use crate::router;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    /// Reconnect attempts exhausted. Terminal.
    Failed = 4,
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> SessionState {
        match self.0.load(Ordering::SeqCst) {
            0 => SessionState::Disconnected,
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Reconnecting,
            _ => SessionState::Failed,
        }
    }

    fn store(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// State shared between the public handle, the driver task, and lock
/// callbacks. Lock callbacks hold only a `Weak` back-reference, so dropping
/// the last `PgPubSub` clone tears everything down.
pub(crate) struct Shared {
    pub(crate) config: PubSubConfig,
    pub(crate) client: SharedClient,
    pub(crate) session_id: Arc<RwLock<Uuid>>,
    /// Tracked channels. `Some(lock)` in single-listener mode, `None` as the
    /// tracked-channel marker otherwise.
    pub(crate) channels: DashMap<String, Option<ChannelLock>>,
    pub(crate) hub: EventHub,
    state: StateCell,
    retry: AtomicU32,
    auto_reconnect: AtomicBool,
    destroyed: AtomicBool,
}

/// A reliable PostgreSQL `LISTEN`/`NOTIFY` pub/sub session.
///
/// # Example
///
/// ```ignore
/// let bus = PgPubSub::new(PubSubConfig::new("postgres://localhost/app"));
/// bus.connect().await?;
/// let mut events = bus.events();
/// bus.listen("jobs").await?;
/// bus.notify("jobs", &serde_json::json!({"id": 1})).await?;
/// ```
#[derive(Clone)]
pub struct PgPubSub {
    shared: Arc<Shared>,
}

impl PgPubSub {
    /// Create a cold session. Nothing touches the network until
    /// [`connect`](Self::connect).
    pub fn new(config: PubSubConfig) -> Self {
        let hub = EventHub::new(config.event_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                client: Arc::new(RwLock::new(None)),
                session_id: Arc::new(RwLock::new(Uuid::new_v4())),
                channels: DashMap::new(),
                hub,
                state: StateCell::new(SessionState::Disconnected),
                retry: AtomicU32::new(0),
                auto_reconnect: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Establish the connection and arm auto-reconnect. Idempotent while
    /// live.
    pub async fn connect(&self) -> Result<()> {
        self.shared.config.validate()?;
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        if self.is_connected() {
            debug!("already connected");
            return Ok(());
        }

        self.shared.state.store(SessionState::Connecting);
        match Shared::establish(&self.shared).await {
            Ok(()) => {
                self.shared.auto_reconnect.store(true, Ordering::SeqCst);
                self.shared.state.store(SessionState::Connected);
                self.shared.hub.emit(SessionEvent::Connected);
                info!("connected");
                Ok(())
            }
            Err(e) => {
                self.shared.state.store(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Disarm auto-reconnect and end the connection. Locks are not
    /// destroyed; peers recover them through the liveness check.
    pub async fn close(&self) {
        Shared::close_inner(&self.shared).await;
    }

    /// Close the session and tear down the process-wide lock state,
    /// concurrently. The session is unusable afterwards.
    pub async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::join!(Shared::close_inner(&self.shared), ChannelLock::destroy_all());
        self.shared.channels.clear();
        self.shared.hub.clear();
        info!("session destroyed");
    }

    /// Subscribe to a channel.
    ///
    /// In single-listener mode returns `true` when this session won the
    /// channel and is now the live consumer; `false` means a peer holds it
    /// and this session takes over automatically when the peer releases or
    /// dies. Multi-listener mode always subscribes immediately.
    pub async fn listen(&self, channel: &str) -> Result<bool> {
        Shared::do_listen(&self.shared, channel).await
    }

    /// Unsubscribe from a channel, releasing its lock in single-listener
    /// mode.
    pub async fn unlisten(&self, channel: &str) -> Result<()> {
        let client = current_client(&self.shared.client).await?;
        client
            .batch_execute(&format!("UNLISTEN {}", quote_ident(channel)))
            .await?;
        if let Some((_, Some(chan_lock))) = self.shared.channels.remove(channel) {
            chan_lock.destroy().await?;
        }
        self.shared
            .hub
            .emit(SessionEvent::Unlisten(vec![channel.to_string()]));
        info!(channel, "unlistened");
        Ok(())
    }

    /// Unsubscribe from every tracked channel.
    pub async fn unlisten_all(&self) -> Result<()> {
        let client = current_client(&self.shared.client).await?;
        client.batch_execute("UNLISTEN *").await?;

        let names: Vec<String> = self.shared.channels.iter().map(|e| e.key().clone()).collect();
        let mut removed = Vec::with_capacity(names.len());
        for name in names {
            if let Some((_, entry)) = self.shared.channels.remove(&name) {
                if let Some(chan_lock) = entry {
                    if let Err(e) = chan_lock.destroy().await {
                        warn!(channel = %name, error = %e, "lock teardown failed");
                    }
                }
                removed.push(name);
            }
        }

        self.shared.hub.emit(SessionEvent::Unlisten(removed));
        info!("unlistened all channels");
        Ok(())
    }

    /// Publish a JSON payload on a channel.
    ///
    /// Encoding failures are logged and published as the empty string; they
    /// do not fail the call.
    pub async fn notify(&self, channel: &str, message: &Value) -> Result<()> {
        if lock::is_lock_channel(channel) {
            return Err(Error::ReservedChannel {
                channel: channel.to_string(),
            });
        }
        let client = current_client(&self.shared.client).await?;
        let packed = match payload::pack(message) {
            Ok(packed) => packed,
            Err(e) => {
                error!(channel, error = %e, "failed to encode payload");
                String::new()
            }
        };
        let stmt = format!(
            "NOTIFY {}, {}",
            quote_ident(channel),
            quote_literal(&packed)
        );
        client.batch_execute(&stmt).await?;
        debug!(channel, "notified");
        Ok(())
    }

    /// Channels this session is the live consumer of.
    pub fn active_channels(&self) -> Vec<String> {
        if !self.is_connected() {
            return Vec::new();
        }
        self.shared
            .channels
            .iter()
            .filter(|entry| match entry.value() {
                Some(chan_lock) => chan_lock.is_acquired(),
                None => true,
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Tracked channels currently held by a peer (or awaiting reconnect).
    pub fn inactive_channels(&self) -> Vec<String> {
        let active: std::collections::HashSet<String> =
            self.active_channels().into_iter().collect();
        self.shared
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|name| !active.contains(name))
            .collect()
    }

    /// Every tracked channel, active or not.
    pub fn all_channels(&self) -> Vec<String> {
        self.shared
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// The identity advertised as `application_name` for this connection.
    /// Regenerated on every reconnect.
    pub async fn session_id(&self) -> Uuid {
        *self.shared.session_id.read().await
    }

    /// Subscribe to the session event stream.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.hub.subscribe()
    }

    /// Subscribe to one channel's payload stream.
    pub fn channel_events(&self, channel: &str) -> broadcast::Receiver<Value> {
        self.shared.hub.channel(channel)
    }
}

impl Shared {
    /// Connect, stamp a fresh identity, and hand the connection to the
    /// driver task.
    async fn establish(shared: &Arc<Shared>) -> Result<()> {
        let (client, connection) =
            connect::connect_with_sslmode(&shared.config.database_url).await?;
        let client = Arc::new(client);

        let id = Uuid::new_v4();
        *shared.session_id.write().await = id;
        *shared.client.write().await = Some(client.clone());

        // Best-effort identification: losing it only degrades peer crash
        // detection, never correctness.
        let stmt = format!("SET application_name = {}", quote_literal(&id.to_string()));
        if let Err(e) = client.batch_execute(&stmt).await {
            warn!(error = %e, "failed to set application_name");
        }

        Shared::spawn_driver(shared, connection);
        Ok(())
    }

    /// Drive the connection: forward notifications to the router until the
    /// stream ends, then hand off to the reconnect machinery.
    fn spawn_driver(shared: &Arc<Shared>, mut connection: PgConnection) {
        let weak = Arc::downgrade(shared);
        tokio::spawn(async move {
            let failure = loop {
                match poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        let Some(shared) = weak.upgrade() else { return };
                        router::route(&shared, n.channel(), n.payload()).await;
                    }
                    Some(Ok(_)) => {
                        // Notices and parameter changes are not ours to handle
                    }
                    Some(Err(e)) => break Some(e),
                    None => break None,
                }
            };

            let Some(shared) = weak.upgrade() else { return };
            Shared::on_disconnect(&shared, failure).await;
        });
    }

    /// The connection is gone: demote every tracked channel, report, and
    /// reconnect when armed.
    async fn on_disconnect(shared: &Arc<Shared>, failure: Option<tokio_postgres::Error>) {
        *shared.client.write().await = None;

        // Every tracked channel is now known-inactive; peers take over
        // through the liveness check.
        for entry in shared.channels.iter() {
            if let Some(chan_lock) = entry.value() {
                chan_lock.demote();
            }
        }

        if let Some(e) = failure {
            error!(error = %e, "connection error");
            shared.hub.emit_error(Error::Connect { source: e });
        }
        shared.hub.emit(SessionEvent::Ended);

        if !shared.auto_reconnect.load(Ordering::SeqCst) {
            if shared.state.load() != SessionState::Failed {
                shared.state.store(SessionState::Disconnected);
            }
            return;
        }

        shared.state.store(SessionState::Reconnecting);
        info!("connection lost, reconnecting");
        Shared::reconnect_loop(shared).await;
    }

    async fn reconnect_loop(shared: &Arc<Shared>) {
        loop {
            time::sleep(shared.config.retry_delay).await;

            // close() or destroy() during the wait cancels the cycle
            if shared.destroyed.load(Ordering::SeqCst)
                || !shared.auto_reconnect.load(Ordering::SeqCst)
            {
                shared.state.store(SessionState::Disconnected);
                return;
            }

            let attempt = shared.retry.fetch_add(1, Ordering::SeqCst) + 1;
            match Shared::establish(shared).await {
                Ok(()) => {
                    shared.hub.emit(SessionEvent::Connected);
                    Shared::relisten_all(shared).await;
                    shared.state.store(SessionState::Connected);
                    shared.hub.emit(SessionEvent::Reconnected(attempt));
                    shared.retry.store(0, Ordering::SeqCst);
                    info!(attempt, "reconnected");
                    return;
                }
                Err(e) if attempt >= shared.config.retry_limit => {
                    error!(error = %e, attempts = attempt, "giving up on reconnect");
                    shared.state.store(SessionState::Failed);
                    shared.hub.emit_error(Error::RetryExhausted { attempts: attempt });
                    Shared::close_inner(shared).await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "reconnect attempt failed");
                }
            }
        }
    }

    /// Re-drive every tracked channel through its acquisition path,
    /// concurrently. Order across channels is unspecified.
    async fn relisten_all(shared: &Arc<Shared>) {
        let names: Vec<String> = shared.channels.iter().map(|e| e.key().clone()).collect();
        let tasks: Vec<_> = names
            .into_iter()
            .map(|name| {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = Shared::do_listen(&shared, &name).await {
                        warn!(channel = %name, error = %e, "re-listen failed");
                    }
                })
            })
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub(crate) async fn do_listen(shared: &Arc<Shared>, channel: &str) -> Result<bool> {
        if lock::is_lock_channel(channel) {
            return Err(Error::ReservedChannel {
                channel: channel.to_string(),
            });
        }

        if !shared.config.single_listener {
            Shared::issue_listen(shared, channel).await?;
            shared.channels.insert(channel.to_string(), None);
            shared
                .hub
                .emit(SessionEvent::Listen(channel.to_string()));
            info!(channel, "listening");
            return Ok(true);
        }

        let chan_lock = Shared::lock_for(shared, channel);
        chan_lock.init().await?;
        if !chan_lock.acquire().await? {
            debug!(channel, "channel held by a peer, waiting");
            return Ok(false);
        }

        if let Err(e) = Shared::issue_listen(shared, channel).await {
            // No LISTEN is in force, so the lock must not stay claimed:
            // hand it back now so a peer can take the channel instead of
            // waiting for this session to die.
            if let Err(release_err) = chan_lock.release().await {
                warn!(channel, error = %release_err, "failed to hand back the lock");
            }
            return Err(e);
        }

        shared
            .hub
            .emit(SessionEvent::Listen(channel.to_string()));
        info!(channel, "listening");
        Ok(true)
    }

    async fn issue_listen(shared: &Arc<Shared>, channel: &str) -> Result<()> {
        let client = current_client(&shared.client).await?;
        client
            .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
            .await?;
        Ok(())
    }

    /// Get or lazily create the lock for a channel, wiring its release
    /// callback back into the listen path through a weak reference.
    fn lock_for(shared: &Arc<Shared>, channel: &str) -> ChannelLock {
        let mut entry = shared.channels.entry(channel.to_string()).or_default();
        if let Some(chan_lock) = entry.value() {
            return chan_lock.clone();
        }

        let chan_lock = ChannelLock::new(
            channel,
            shared.client.clone(),
            shared.session_id.clone(),
            shared.config.acquire_interval,
        );
        let weak = Arc::downgrade(shared);
        chan_lock.on_release(move |name| {
            let Some(shared) = weak.upgrade() else { return };
            let name = name.to_string();
            tokio::spawn(async move {
                match Shared::do_listen(&shared, &name).await {
                    Ok(true) => debug!(channel = %name, "took over the channel"),
                    Ok(false) => {}
                    Err(e) => {
                        debug!(channel = %name, error = %e, "re-acquire attempt failed")
                    }
                }
            });
        });
        *entry.value_mut() = Some(chan_lock.clone());
        chan_lock
    }

    async fn close_inner(shared: &Arc<Shared>) {
        shared.auto_reconnect.store(false, Ordering::SeqCst);
        // Dropping the client ends the connection; the driver task observes
        // the stream end and emits `Ended`.
        let _ = shared.client.write().await.take();
        if shared.state.load() != SessionState::Failed {
            shared.state.store(SessionState::Disconnected);
        }
        shared.hub.emit(SessionEvent::Closed);
        info!("session closed");
    }
}

#[cfg(test)]
impl PgPubSub {
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Track a channel whose lock is pending, as if a peer held it.
    pub(crate) fn track_waiting_channel(&self, channel: &str) {
        let _ = Shared::lock_for(&self.shared, channel);
    }
}

impl std::fmt::Debug for PgPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPubSub")
            .field("state", &self.state())
            .field("channels", &self.shared.channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PubSubConfig;

    fn cold_session() -> PgPubSub {
        PgPubSub::new(PubSubConfig::new("postgres://localhost/app"))
    }

    #[test]
    fn test_cold_session_state() {
        let bus = cold_session();
        assert_eq!(bus.state(), SessionState::Disconnected);
        assert!(!bus.is_connected());
        assert!(bus.all_channels().is_empty());
        assert!(bus.active_channels().is_empty());
        assert!(bus.inactive_channels().is_empty());
    }

    #[tokio::test]
    async fn test_listen_requires_connection() {
        let bus = cold_session();
        assert!(matches!(
            bus.listen("jobs").await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_notify_requires_connection() {
        let bus = cold_session();
        assert!(matches!(
            bus.notify("jobs", &serde_json::json!(1)).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_reserved_channel_rejected() {
        let bus = cold_session();
        assert!(matches!(
            bus.listen("__jobs__lock__").await,
            Err(Error::ReservedChannel { .. })
        ));
        assert!(matches!(
            bus.notify("__jobs__lock__", &serde_json::json!(1)).await,
            Err(Error::ReservedChannel { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let bus = PgPubSub::new(PubSubConfig::new("postgres://localhost/app").retry_limit(0));
        assert!(matches!(bus.connect().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_close_emits_closed() {
        let bus = cold_session();
        let mut events = bus.events();
        bus.close().await;
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Closed
        ));
        assert_eq!(bus.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_tracked_channels_inactive_while_disconnected() {
        let bus = cold_session();
        // A channel waiting on a peer, tracked but not acquired
        let _ = Shared::lock_for(&bus.shared, "jobs");
        assert_eq!(bus.all_channels(), vec!["jobs".to_string()]);
        assert!(bus.active_channels().is_empty());
        assert_eq!(bus.inactive_channels(), vec!["jobs".to_string()]);
    }

    #[tokio::test]
    async fn test_lock_for_reuses_existing_lock() {
        let bus = cold_session();
        let first = Shared::lock_for(&bus.shared, "jobs");
        let second = Shared::lock_for(&bus.shared, "jobs");
        assert_eq!(first.channel(), second.channel());
        assert_eq!(bus.all_channels().len(), 1);
        first.destroy().await.unwrap();
    }
}
