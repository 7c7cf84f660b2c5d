//! Cross-process channel locks
//!
//! Cooperative single-consumer arbitration keyed by channel name, using
//! only the database as the coordination fabric. A lock for channel `C`
//! claims a row in `pgcast.channel_locks` tagged with the session's
//! `application_name`; peers verify liveness against `pg_stat_activity`, so
//! a crashed holder is claimable after at most one probe period plus the
//! server's session-cleanup delay. Releases are advertised on the derived
//! sub-channel `__C__lock__`, which the router never surfaces to
//! application handlers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connect::{current_client, SharedClient};
use crate::error::{Error, Result};
use crate::payload::{quote_ident, quote_literal};

static LOCK_CHANNEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^__(.+)__lock__$").expect("valid lock-channel pattern"));

/// Derive the reserved sub-channel name for `channel`.
pub(crate) fn lock_channel(channel: &str) -> String {
    format!("__{channel}__lock__")
}

/// True when `name` has the reserved lock-channel shape.
pub(crate) fn is_lock_channel(name: &str) -> bool {
    LOCK_CHANNEL_RE.is_match(name)
}

/// Extract the application channel a lock-channel name was derived from.
pub(crate) fn base_channel(name: &str) -> Option<&str> {
    LOCK_CHANNEL_RE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

const SETUP_SQL: &str = "\
CREATE SCHEMA IF NOT EXISTS pgcast;
CREATE UNLOGGED TABLE IF NOT EXISTS pgcast.channel_locks (
    channel     text PRIMARY KEY,
    holder      text NOT NULL,
    acquired_at timestamptz NOT NULL DEFAULT now()
)";

// The upsert succeeds when the row is absent, already ours, or owned by a
// session whose application_name no longer appears in pg_stat_activity.
// Conflict resolution inside the database is the tie-break between
// concurrently probing peers.
const ACQUIRE_SQL: &str = "\
INSERT INTO pgcast.channel_locks AS locks (channel, holder)
VALUES ($1, $2)
ON CONFLICT (channel) DO UPDATE
   SET holder = EXCLUDED.holder, acquired_at = now()
 WHERE locks.holder = EXCLUDED.holder
    OR NOT EXISTS (
           SELECT 1 FROM pg_stat_activity
            WHERE application_name = locks.holder
       )
RETURNING channel";

const RELEASE_SQL: &str = "\
DELETE FROM pgcast.channel_locks
 WHERE channel = $1 AND holder = $2";

/// Record published on the derived sub-channel when a holder releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReleaseRecord {
    pub channel: String,
    pub holder: String,
}

type ReleaseCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Live locks in this process, keyed by lock id. [`ChannelLock::destroy_all`]
/// drains it.
static REGISTRY: LazyLock<DashMap<u64, Weak<LockInner>>> = LazyLock::new(DashMap::new);
static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(0);

struct LockInner {
    id: u64,
    channel: String,
    lock_channel: String,
    client: SharedClient,
    session_id: Arc<RwLock<Uuid>>,
    acquired: AtomicBool,
    initialized: AtomicBool,
    destroyed: AtomicBool,
    on_release: Mutex<Option<ReleaseCallback>>,
    probe: Mutex<Option<AbortHandle>>,
}

/// A distributed mutex for one channel.
///
/// Created lazily by the session on first `listen` in single-listener mode.
/// Clones share state.
#[derive(Clone)]
pub struct ChannelLock {
    inner: Arc<LockInner>,
}

impl ChannelLock {
    pub(crate) fn new(
        channel: &str,
        client: SharedClient,
        session_id: Arc<RwLock<Uuid>>,
        acquire_interval: Duration,
    ) -> Self {
        let inner = Arc::new(LockInner {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            channel: channel.to_string(),
            lock_channel: lock_channel(channel),
            client,
            session_id,
            acquired: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            on_release: Mutex::new(None),
            probe: Mutex::new(None),
        });

        REGISTRY.insert(inner.id, Arc::downgrade(&inner));

        let handle = spawn_probe(Arc::downgrade(&inner), acquire_interval);
        if let Ok(mut probe) = inner.probe.lock() {
            *probe = Some(handle);
        }

        Self { inner }
    }

    /// The channel this lock arbitrates.
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Idempotent setup: subscribe to the derived sub-channel and ensure the
    /// tracking table exists. Re-run after every reconnect.
    pub async fn init(&self) -> Result<()> {
        if self.inner.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let client = current_client(&self.inner.client).await?;
        let listen = format!("LISTEN {}", quote_ident(&self.inner.lock_channel));
        client
            .batch_execute(&listen)
            .await
            .map_err(|source| Error::LockSetup {
                channel: self.inner.channel.clone(),
                source,
            })?;
        client
            .batch_execute(SETUP_SQL)
            .await
            .map_err(|source| Error::LockSetup {
                channel: self.inner.channel.clone(),
                source,
            })?;
        self.inner.initialized.store(true, Ordering::SeqCst);
        debug!(channel = %self.inner.channel, "lock initialized");
        Ok(())
    }

    /// Try to become the holder. One round trip; `false` means a live peer
    /// holds the channel. Calling while already held returns `true`.
    pub async fn acquire(&self) -> Result<bool> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let client = current_client(&self.inner.client).await?;
        let holder = self.inner.session_id.read().await.to_string();
        let rows = client
            .query(ACQUIRE_SQL, &[&self.inner.channel, &holder])
            .await?;
        let won = !rows.is_empty();
        self.inner.acquired.store(won, Ordering::SeqCst);
        debug!(channel = %self.inner.channel, acquired = won, "lock probe");
        Ok(won)
    }

    /// Relinquish the lock if held and advertise the release so waiters can
    /// race for acquisition. No-op when not held.
    pub async fn release(&self) -> Result<()> {
        if !self.inner.acquired.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let client = match current_client(&self.inner.client).await {
            Ok(client) => client,
            // Connection gone: the row is claimable through the liveness
            // check, nothing to do here.
            Err(_) => return Ok(()),
        };
        let holder = self.inner.session_id.read().await.to_string();
        client
            .execute(RELEASE_SQL, &[&self.inner.channel, &holder])
            .await?;

        let record = ReleaseRecord {
            channel: self.inner.channel.clone(),
            holder,
        };
        let payload = serde_json::to_string(&record).unwrap_or_default();
        let notify = format!(
            "NOTIFY {}, {}",
            quote_ident(&self.inner.lock_channel),
            quote_literal(&payload)
        );
        client.batch_execute(&notify).await?;
        debug!(channel = %self.inner.channel, "lock released");
        Ok(())
    }

    /// Cached observation of the acquisition state.
    pub fn is_acquired(&self) -> bool {
        self.inner.acquired.load(Ordering::SeqCst)
    }

    /// Register the callback fired with the channel name whenever a peer
    /// release is observed, and on every probe tick while waiting. The
    /// session routes both through its listen path to retry acquisition.
    pub fn on_release<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.on_release.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    /// Feed an observed release record to this lock. Our own release
    /// advertisements are not retry triggers.
    pub(crate) async fn peer_released(&self, holder: &str) {
        let own = self.inner.session_id.read().await.to_string();
        if holder == own {
            return;
        }
        debug!(channel = %self.inner.channel, "peer released the channel");
        self.inner.fire();
    }

    /// Forget the acquisition locally after a disconnect. The database side
    /// self-cleans once our old session disappears from `pg_stat_activity`.
    pub(crate) fn demote(&self) {
        self.inner.acquired.store(false, Ordering::SeqCst);
        self.inner.initialized.store(false, Ordering::SeqCst);
    }

    /// Terminal teardown: release if held, stop the probe, drop the
    /// callback, unsubscribe the derived sub-channel, deregister.
    pub async fn destroy(&self) -> Result<()> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut probe) = self.inner.probe.lock() {
            if let Some(handle) = probe.take() {
                handle.abort();
            }
        }
        if let Ok(mut slot) = self.inner.on_release.lock() {
            *slot = None;
        }
        REGISTRY.remove(&self.inner.id);

        self.release().await?;
        if let Ok(client) = current_client(&self.inner.client).await {
            let unlisten = format!("UNLISTEN {}", quote_ident(&self.inner.lock_channel));
            client.batch_execute(&unlisten).await?;
        }
        debug!(channel = %self.inner.channel, "lock destroyed");
        Ok(())
    }

    /// Tear down every live lock in the process. Idempotent.
    pub async fn destroy_all() {
        let locks: Vec<Arc<LockInner>> = REGISTRY
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        REGISTRY.clear();

        for inner in locks {
            let lock = ChannelLock { inner };
            if let Err(e) = lock.destroy().await {
                warn!(channel = %lock.inner.channel, error = %e, "lock teardown failed");
            }
        }
    }
}

impl LockInner {
    fn fire(&self) {
        if let Ok(slot) = self.on_release.lock() {
            if let Some(callback) = slot.as_ref() {
                callback(&self.channel);
            }
        }
    }
}

impl std::fmt::Debug for ChannelLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLock")
            .field("channel", &self.inner.channel)
            .field("acquired", &self.is_acquired())
            .finish()
    }
}

/// Re-acquisition probe: while the lock is wanted but not held, fire the
/// release callback every interval so the owner retries through its normal
/// listen path.
fn spawn_probe(weak: Weak<LockInner>, every: Duration) -> AbortHandle {
    let handle = tokio::spawn(async move {
        let mut tick = time::interval_at(time::Instant::now() + every, every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            if inner.destroyed.load(Ordering::SeqCst) {
                break;
            }
            if inner.acquired.load(Ordering::SeqCst) {
                continue;
            }
            inner.fire();
        }
    });
    handle.abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn empty_client() -> SharedClient {
        Arc::new(RwLock::new(None))
    }

    fn session_id() -> Arc<RwLock<Uuid>> {
        Arc::new(RwLock::new(Uuid::new_v4()))
    }

    // Detach a test lock from the process registry so concurrently running
    // destroy_all tests cannot tear it down mid-assertion.
    fn detach(lock: &ChannelLock) {
        REGISTRY.remove(&lock.inner.id);
    }

    #[test]
    fn test_lock_channel_naming() {
        assert_eq!(lock_channel("jobs"), "__jobs__lock__");
        assert_eq!(lock_channel("room-42"), "__room-42__lock__");
    }

    #[test]
    fn test_lock_channel_matching() {
        assert!(is_lock_channel("__jobs__lock__"));
        assert!(is_lock_channel("__a b c__lock__"));
        assert!(!is_lock_channel("jobs"));
        assert!(!is_lock_channel("__jobs__lock"));
        assert!(!is_lock_channel("jobs__lock__"));
        assert!(!is_lock_channel("____lock__"));
    }

    #[test]
    fn test_base_channel_extraction() {
        assert_eq!(base_channel("__jobs__lock__"), Some("jobs"));
        assert_eq!(base_channel(&lock_channel("room-42")), Some("room-42"));
        assert_eq!(base_channel("jobs"), None);
    }

    #[test]
    fn test_release_record_roundtrip() {
        let record = ReleaseRecord {
            channel: "jobs".into(),
            holder: Uuid::new_v4().to_string(),
        };
        let raw = serde_json::to_string(&record).unwrap();
        let back: ReleaseRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.channel, record.channel);
        assert_eq!(back.holder, record.holder);
    }

    #[tokio::test]
    async fn test_new_lock_is_unacquired() {
        let lock = ChannelLock::new("jobs", empty_client(), session_id(), Duration::from_secs(60));
        assert!(!lock.is_acquired());
        assert_eq!(lock.channel(), "jobs");
        lock.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_without_connection_fails() {
        let lock = ChannelLock::new("jobs", empty_client(), session_id(), Duration::from_secs(60));
        assert!(matches!(lock.acquire().await, Err(Error::NotConnected)));
        lock.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_when_not_held_is_noop() {
        let lock = ChannelLock::new("jobs", empty_client(), session_id(), Duration::from_secs(60));
        lock.release().await.unwrap();
        lock.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_release_fires_callback_once() {
        let lock = ChannelLock::new("jobs", empty_client(), session_id(), Duration::from_secs(60));
        detach(&lock);
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        lock.on_release(move |channel| {
            assert_eq!(channel, "jobs");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        lock.peer_released("some-other-session").await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Our own advertisement must not retrigger
        let own = lock.inner.session_id.read().await.to_string();
        lock.peer_released(&own).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        lock.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_fires_while_waiting() {
        let lock = ChannelLock::new(
            "jobs",
            empty_client(),
            session_id(),
            Duration::from_millis(10),
        );
        detach(&lock);
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        lock.on_release(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = time::Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) < 2 && time::Instant::now() < deadline {
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fired.load(Ordering::SeqCst) >= 2);

        lock.destroy().await.unwrap();
        let after = fired.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let lock = ChannelLock::new("jobs", empty_client(), session_id(), Duration::from_secs(60));
        lock.destroy().await.unwrap();
        lock.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_all_is_idempotent() {
        let _keep = ChannelLock::new("a", empty_client(), session_id(), Duration::from_secs(60));
        ChannelLock::destroy_all().await;
        ChannelLock::destroy_all().await;
    }
}
