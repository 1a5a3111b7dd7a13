//! Per-peer heartbeat timers.
//!
//! Two independent timer sets:
//! - **send** timers exist for peers that asked us to heartbeat them; each
//!   fires a Heartbeat at the interval the peer requested.
//! - **recv** timers exist for peers we asked to heartbeat us (only while
//!   [`HeartbeatConfig::required`]); each expires after
//!   [`HeartbeatConfig::timeout`] of silence.
//!
//! The scheduler only keeps time. The node acts on the returned
//! [`HeartbeatAction`]s.

use crate::membership::PeerAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Local heartbeat policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Ask peers to heartbeat us and watch for silence (default: true)
    pub required: bool,
    /// Interval we ask peers to heartbeat at (default: 1s)
    #[serde(with = "secs_f32", rename = "request_interval_secs")]
    pub request_interval: Duration,
    /// Silence tolerated before a peer is Lost (default: 3s)
    #[serde(with = "secs_f32", rename = "timeout_secs")]
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            required: true,
            request_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(3),
        }
    }
}

impl HeartbeatConfig {
    /// No heartbeats requested, no liveness tracking.
    pub fn disabled() -> Self {
        Self {
            required: false,
            ..Self::default()
        }
    }
}

/// Durations as fractional seconds, the unit used on the wire.
mod secs_f32 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f32(d.as_secs_f32())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f32::deserialize(d)?;
        Duration::try_from_secs_f32(secs).map_err(serde::de::Error::custom)
    }
}

/// Something the node must do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a Heartbeat to this peer
    Send(PeerAddress),
    /// This peer has been silent past the timeout
    Expired(PeerAddress),
}

#[derive(Debug, Clone)]
struct Timer {
    elapsed: Duration,
    limit: Duration,
}

impl Timer {
    fn new(limit: Duration) -> Self {
        Self {
            elapsed: Duration::ZERO,
            limit,
        }
    }

    fn is_due(&self) -> bool {
        self.elapsed >= self.limit
    }

    /// Keep the overshoot so the average rate matches the interval.
    fn rewind(&mut self) {
        let limit = self.limit.as_nanos();
        self.elapsed = if limit == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.elapsed.as_nanos() % limit) as u64)
        };
    }
}

#[derive(Debug, Clone)]
struct RecvTimer {
    timer: Timer,
    /// Set once the timeout fired; cleared by a reset
    expired: bool,
}

/// Heartbeat timers for every peer.
#[derive(Debug, Default)]
pub struct HeartbeatScheduler {
    config: HeartbeatConfig,
    send: BTreeMap<PeerAddress, Timer>,
    recv: BTreeMap<PeerAddress, RecvTimer>,
}

impl HeartbeatScheduler {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            send: BTreeMap::new(),
            recv: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Replace the local policy.
    ///
    /// Existing recv timers keep their old limit until re-armed.
    pub fn set_config(&mut self, config: HeartbeatConfig) {
        self.config = config;
    }

    /// (Re)arm the recv timer for `address` at the configured timeout.
    pub fn arm_recv(&mut self, address: PeerAddress) {
        self.recv.insert(
            address,
            RecvTimer {
                timer: Timer::new(self.config.timeout),
                expired: false,
            },
        );
    }

    /// (Re)arm the send timer for `address`.
    pub fn arm_send(&mut self, address: PeerAddress, interval: Duration) {
        self.send.insert(address, Timer::new(interval));
    }

    pub fn has_recv(&self, address: &PeerAddress) -> bool {
        self.recv.contains_key(address)
    }

    pub fn has_send(&self, address: &PeerAddress) -> bool {
        self.send.contains_key(address)
    }

    /// Reset a recv timer after a heartbeat.
    ///
    /// Returns false if no recv timer is armed for `address`.
    pub fn reset_recv(&mut self, address: &PeerAddress) -> bool {
        match self.recv.get_mut(address) {
            Some(recv) => {
                recv.timer.elapsed = Duration::ZERO;
                recv.expired = false;
                true
            }
            None => false,
        }
    }

    /// Drop both timers for `address`.
    pub fn remove(&mut self, address: &PeerAddress) {
        self.send.remove(address);
        self.recv.remove(address);
    }

    pub fn clear(&mut self) {
        self.send.clear();
        self.recv.clear();
    }

    /// Advance every timer by `elapsed`.
    ///
    /// Send timers always advance. Recv timers advance only while heartbeats
    /// are required, and each expires at most once until reset.
    pub fn advance(&mut self, elapsed: Duration) -> Vec<HeartbeatAction> {
        let mut actions = Vec::new();

        for (address, timer) in self.send.iter_mut() {
            timer.elapsed = timer.elapsed.saturating_add(elapsed);
            if timer.is_due() {
                actions.push(HeartbeatAction::Send(*address));
                timer.rewind();
            }
        }

        if self.config.required {
            for (address, recv) in self.recv.iter_mut() {
                recv.timer.elapsed = recv.timer.elapsed.saturating_add(elapsed);
                if recv.timer.is_due() && !recv.expired {
                    recv.expired = true;
                    actions.push(HeartbeatAction::Expired(*address));
                }
            }
        }

        actions
    }
}
