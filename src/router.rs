//! Notification routing
//!
//! Pure demultiplexer over the `(channel, payload)` pairs the driver task
//! pulls off the connection. Lock-protocol traffic is consumed by the lock
//! subsystem and never surfaces as an application message; everything else
//! is decoded and fanned out general-first, then per-channel.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Error;
use crate::lock::{self, ChannelLock, ReleaseRecord};
use crate::payload;
use crate::session::Shared;

pub(crate) async fn route(shared: &Arc<Shared>, channel: &str, raw: &str) {
    if let Some(base) = lock::base_channel(channel) {
        route_lock_traffic(shared, base, raw).await;
        return;
    }

    if shared.config.single_listener {
        let held_by_peer = shared
            .channels
            .get(channel)
            .and_then(|entry| entry.value().clone())
            .map(|chan_lock| !chan_lock.is_acquired())
            .unwrap_or(false);
        if held_by_peer {
            // A peer is the designated consumer; it delivers this one
            debug!(channel, "dropping message for a channel held by a peer");
            return;
        }
    }

    match payload::unpack(raw) {
        Ok(value) => shared.hub.emit_message(channel, value),
        Err(e) => {
            warn!(channel, error = %e, "malformed payload");
            shared.hub.emit_error(Error::Decode {
                channel: channel.to_string(),
                payload: raw.to_string(),
                source: e,
            });
        }
    }
}

/// A release record arrived on a derived sub-channel: hand it to the lock
/// for the base channel, if this session tracks one.
async fn route_lock_traffic(shared: &Arc<Shared>, base: &str, raw: &str) {
    let holder = match serde_json::from_str::<ReleaseRecord>(raw) {
        Ok(record) => record.holder,
        Err(e) => {
            debug!(channel = base, error = %e, "unreadable release record");
            String::new()
        }
    };

    let chan_lock: Option<ChannelLock> = shared
        .channels
        .get(base)
        .and_then(|entry| entry.value().clone());
    if let Some(chan_lock) = chan_lock {
        chan_lock.peer_released(&holder).await;
    }
}
