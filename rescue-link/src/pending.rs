//! Request/response correlation and peer liveness.
//!
//! Neither table locks by itself: the [Node](crate::node::Node) keeps each behind its
//! own mutex, shared by the receive path, the dispatch workers and the watchdog.
use log::{debug, info};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::message::Capabilities;
use crate::LoRaAddress;

/// Delay without a standard response after which a peer is presumed gone.
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(60);

/// Outstanding requests, as a multiset of message ids per destination.
///
/// The same id can be pending several times for one destination (the same command
/// sent twice), each reply resolves one occurrence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingRequests {
    entries: HashMap<LoRaAddress, Vec<u8>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, dest: LoRaAddress, msg_id: u8) {
        self.entries.entry(dest).or_default().push(msg_id);
        debug!("Added pending request {} to {}.", msg_id, dest);
    }

    /// Removes one occurrence of `(dest, msg_id)`, returns whether one was pending.
    pub fn remove(&mut self, dest: LoRaAddress, msg_id: u8) -> bool {
        let Some(ids) = self.entries.get_mut(&dest) else {
            return false;
        };
        let Some(pos) = ids.iter().position(|id| *id == msg_id) else {
            return false;
        };
        ids.remove(pos);
        if ids.is_empty() {
            self.entries.remove(&dest);
        }
        debug!("Removed pending request {} to {}.", msg_id, dest);
        true
    }

    /// Drops every request to `dest`, returns how many were pending.
    pub fn forget(&mut self, dest: LoRaAddress) -> usize {
        self.entries.remove(&dest).map_or(0, |ids| ids.len())
    }

    pub fn contains(&self, dest: LoRaAddress, msg_id: u8) -> bool {
        self.entries
            .get(&dest)
            .map_or(false, |ids| ids.contains(&msg_id))
    }

    /// Message ids pending for `dest`, in sending order.
    pub fn get(&self, dest: LoRaAddress) -> &[u8] {
        self.entries.get(&dest).map_or(&[], Vec::as_slice)
    }

    /// Number of destinations with at least one pending request.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the base station knows about a peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub capabilities: Capabilities,
    pub last_seen: Instant,
}

/// Peers that answered recently, evicted once silent for longer than the timeout.
///
/// Every refresh re-arms the peer deadline; [ConnectedNodes::expired] is polled by a
/// watchdog instead of keeping one timer per peer.
#[derive(Clone, Debug)]
pub struct ConnectedNodes {
    peers: HashMap<LoRaAddress, PeerRecord>,
    timeout: Duration,
}

impl Default for ConnectedNodes {
    fn default() -> Self {
        Self::new(DEFAULT_NODE_TIMEOUT)
    }
}

impl ConnectedNodes {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            timeout,
        }
    }

    /// Records a standard response from `addr`, returns true for a new peer.
    pub fn refresh(&mut self, addr: LoRaAddress, capabilities: Capabilities, now: Instant) -> bool {
        let record = PeerRecord {
            capabilities,
            last_seen: now,
        };
        let new = self.peers.insert(addr, record).is_none();
        if new {
            info!("Node {} connected ({}).", addr, capabilities);
        }
        new
    }

    /// Peers whose deadline passed at `now`.
    pub fn expired(&self, now: Instant) -> Vec<LoRaAddress> {
        let mut expired: Vec<LoRaAddress> = self
            .peers
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.last_seen) >= self.timeout)
            .map(|(addr, _)| *addr)
            .collect();
        expired.sort_unstable();
        expired
    }

    pub fn evict(&mut self, addr: LoRaAddress) -> Option<PeerRecord> {
        let record = self.peers.remove(&addr);
        if record.is_some() {
            info!("Node {} removed after {:?} without answer.", addr, self.timeout);
        }
        record
    }

    pub fn get(&self, addr: LoRaAddress) -> Option<&PeerRecord> {
        self.peers.get(&addr)
    }

    /// Capabilities of every connected peer.
    pub fn snapshot(&self) -> HashMap<LoRaAddress, Capabilities> {
        self.peers
            .iter()
            .map(|(addr, record)| (*addr, record.capabilities))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
