//! In-memory radio medium.
//!
//! Every [LoopbackTransceiver] attached to the same [Air] receives the packets sent by
//! all the others, the way every node in range hears a LoRa transmission. Inboxes are
//! bounded: when a station stops polling, its oldest packets are lost.
use log::warn;
use parking_lot::Mutex;
use ringbuf::{HeapRb, Rb};
use std::sync::Arc;

use super::device::{LinkError, Transceiver};

/// Packets kept per station before the oldest are overwritten.
pub const DEFAULT_CAPACITY: usize = 64;

type Inbox = Arc<Mutex<HeapRb<Vec<u8>>>>;

struct Station {
    id: usize,
    inbox: Inbox,
}

/// Shared medium connecting loopback transceivers.
pub struct Air {
    capacity: usize,
    stations: Mutex<Vec<Station>>,
}

impl Air {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            stations: Mutex::new(Vec::new()),
        })
    }

    /// Attaches a new station to the medium.
    pub fn attach(self: &Arc<Self>) -> LoopbackTransceiver {
        let mut stations = self.stations.lock();
        let id = stations.len();
        let inbox = Arc::new(Mutex::new(HeapRb::new(self.capacity)));
        stations.push(Station {
            id,
            inbox: inbox.clone(),
        });
        LoopbackTransceiver {
            id,
            air: self.clone(),
            inbox,
            closed: false,
            rssi: None,
        }
    }

    fn broadcast(&self, from: usize, packet: &[u8]) {
        for station in self.stations.lock().iter().filter(|s| s.id != from) {
            if station.inbox.lock().push_overwrite(packet.to_vec()).is_some() {
                warn!("Loopback station {} overflowed, oldest packet lost.", station.id);
            }
        }
    }
}

pub struct LoopbackTransceiver {
    id: usize,
    air: Arc<Air>,
    inbox: Inbox,
    closed: bool,
    rssi: Option<i16>,
}

impl LoopbackTransceiver {
    /// Two transceivers hearing each other.
    pub fn pair() -> (Self, Self) {
        let air = Air::new();
        (air.attach(), air.attach())
    }

    /// RSSI reported for every received packet.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Number of packets waiting to be received.
    pub fn pending(&self) -> usize {
        self.inbox.lock().len()
    }
}

impl Transceiver for LoopbackTransceiver {
    fn send_bytes(&mut self, data: &[u8]) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        self.air.broadcast(self.id, data);
        Ok(())
    }

    fn receive_bytes(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        Ok(self.inbox.lock().pop())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn reconnect(&mut self) -> Result<(), LinkError> {
        self.closed = false;
        Ok(())
    }

    fn last_rssi(&self) -> Option<i16> {
        self.rssi
    }
}
