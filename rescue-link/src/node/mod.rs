//! The node runtime: one transceiver, the tracker tables and the dispatcher.
//!
//! A [Node] is a cheap handle, clones share the same state. Once [started](Node::start)
//! it runs:
//!
//! - a receive thread decoding, routing and reassembling frames in arrival order, and
//!   handing every complete message to a short-lived dispatch thread;
//! - on a base station, a watchdog evicting silent peers and a periodic broadcast ping;
//! - on a field node with a sync store, the sync packet pusher;
//! - with a media side-channel and a pending list, the retry of undelivered captures;
//! - the loops requested by remote commands (feedback, IMU, battery, autonomy...).
//!
//! Relaying shares the send lock with local sends. While a long fragmented send is in
//! progress, the receive thread blocks on the next frame to relay and inbound handling
//! stalls until the send completes.
//!
//! Tests and single-threaded hosts can instead drive the node with [Node::poll].
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{NodeConfig, Role};
use crate::device::frame::{ControlFlags, Frame, FrameSize};
use crate::device::{LinkError, Transceiver};
use crate::dispatch::{Dispatcher, NodeProfile, Route};
use crate::error::NodeError;
use crate::fragment::{Fragmenter, Reassembler};
use crate::media::{MediaStore, PendingMedia};
use crate::message::{ControlCommand, DataId, MessageKind, ResponseKind};
use crate::observer::{LogObserver, NodeObserver};
use crate::pending::{ConnectedNodes, PendingRequests};
use crate::peripherals::Peripherals;
use crate::telemetry::ImuTracker;
use crate::worker::{StopToken, WorkerKind, Workers};
use crate::{LoRaAddress, BROADCAST};

mod executor;
mod loops;

/// Period of the peer eviction sweep.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

pub struct NodeBuilder {
    config: NodeConfig,
    peripherals: Peripherals,
    observer: Arc<dyn NodeObserver>,
}

impl NodeBuilder {
    pub fn peripherals(mut self, peripherals: Peripherals) -> Self {
        self.peripherals = peripherals;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn NodeObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self, link: impl Transceiver + 'static) -> Result<Node, NodeError> {
        let config = self.config;
        config.validate()?;
        let fragmenter = Fragmenter::new(config.address, config.chunk_size, config.max_frame_len)?;
        let profile = NodeProfile {
            address: config.address,
            role: config.role,
            capabilities: self.peripherals.capabilities(),
            frequency_mhz: config.frequency_mhz,
            power_dbm: config.power_dbm,
        };
        info!(
            "Node {} ({:?}) ready at {} MHz, {} dBm, capabilities {}.",
            config.address, config.role, config.frequency_mhz, config.power_dbm, profile.capabilities
        );
        let inner = Inner {
            dispatcher: Dispatcher::new(profile),
            fragmenter,
            link: Mutex::new(Box::new(link)),
            send_lock: Mutex::new(()),
            reassembler: Mutex::new(Reassembler::new(
                config.reassembly_streams,
                config.reassembly_limit,
                config.reassembly_idle(),
            )),
            pending: Mutex::new(PendingRequests::new()),
            peers: Mutex::new(ConnectedNodes::new(config.node_timeout())),
            relay: AtomicBool::new(false),
            running: AtomicBool::new(true),
            workers: Mutex::new(Workers::new()),
            trackers: Mutex::new(HashMap::new()),
            media: config.media_dir.clone().map(MediaStore::new),
            pending_media: config
                .pending_media_file
                .clone()
                .map(|file| Mutex::new(PendingMedia::load(file))),
            peripherals: self.peripherals,
            observer: self.observer,
            msg_id: AtomicU8::new(1),
            config,
        };
        Ok(Node {
            inner: Arc::new(inner),
        })
    }
}

struct Inner {
    config: NodeConfig,
    dispatcher: Dispatcher,
    fragmenter: Fragmenter,
    link: Mutex<Box<dyn Transceiver>>,
    /// Held for a whole logical send, so fragments of a stream never interleave.
    send_lock: Mutex<()>,
    reassembler: Mutex<Reassembler>,
    pending: Mutex<PendingRequests>,
    peers: Mutex<ConnectedNodes>,
    relay: AtomicBool,
    running: AtomicBool,
    workers: Mutex<Workers>,
    trackers: Mutex<HashMap<LoRaAddress, ImuTracker>>,
    media: Option<MediaStore>,
    pending_media: Option<Mutex<PendingMedia>>,
    peripherals: Peripherals,
    observer: Arc<dyn NodeObserver>,
    msg_id: AtomicU8,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            peripherals: Peripherals::default(),
            observer: Arc::new(LogObserver),
        }
    }

    /// Node without peripherals, logging its events.
    pub fn new(config: NodeConfig, link: impl Transceiver + 'static) -> Result<Self, NodeError> {
        Self::builder(config).build(link)
    }

    pub fn address(&self) -> LoRaAddress {
        self.inner.config.address
    }

    pub fn role(&self) -> Role {
        self.inner.config.role
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn relay_enabled(&self) -> bool {
        self.inner.relay.load(Ordering::SeqCst)
    }

    pub fn set_relay(&self, enabled: bool) {
        self.inner.relay.store(enabled, Ordering::SeqCst);
        info!("Relay mode {}.", if enabled { "enabled" } else { "disabled" });
    }

    /// Snapshot of the outstanding requests.
    pub fn pending(&self) -> PendingRequests {
        self.inner.pending.lock().clone()
    }

    /// Capabilities of the peers that answered recently.
    pub fn connected_nodes(&self) -> HashMap<LoRaAddress, crate::message::Capabilities> {
        self.inner.peers.lock().snapshot()
    }

    /// Captured media not yet delivered over the side-channel.
    pub fn pending_media(&self) -> Vec<PathBuf> {
        self.inner
            .pending_media
            .as_ref()
            .map_or_else(Vec::new, |list| {
                list.lock().list().iter().map(|entry| entry.path.clone()).collect()
            })
    }

    pub fn is_loop_running(&self, kind: WorkerKind) -> bool {
        self.inner.workers.lock().is_running(kind)
    }

    /// A fresh message id for application requests, never 0.
    pub fn next_msg_id(&self) -> u8 {
        loop {
            let id = self.inner.msg_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Sends a text message.
    ///
    /// Text too long for one frame is fragmented like binary payloads. On a base
    /// station, a request of a kind that owes a reply is tracked as pending until the
    /// correlated response arrives.
    pub fn send(
        &self,
        dest: LoRaAddress,
        msg_type: u8,
        msg_id: u8,
        text: &str,
        relay: bool,
    ) -> Result<(), NodeError> {
        let frame = Frame::text(dest, self.address(), msg_type, msg_id, text).with_relay(relay);
        let frames = if frame.size() <= self.inner.config.max_frame_len {
            vec![frame]
        } else {
            let mut frames = self
                .inner
                .fragmenter
                .split(dest, msg_type, msg_id, relay, text.as_bytes());
            for frame in &mut frames {
                frame.control.remove(ControlFlags::BINARY);
            }
            frames
        };
        self.send_tracked(frames)
    }

    /// Sends a binary payload that fits in a single frame.
    pub fn send_bytes(
        &self,
        dest: LoRaAddress,
        msg_type: u8,
        msg_id: u8,
        data: Vec<u8>,
        relay: bool,
    ) -> Result<(), NodeError> {
        let frame = Frame::binary(dest, self.address(), msg_type, msg_id, data, false)
            .with_relay(relay);
        self.send_tracked(vec![frame])
    }

    /// Sends a binary payload of any size as an ordered stream of fragments, pausing
    /// between fragments. Blocks until the last one is sent.
    pub fn send_fragmented(
        &self,
        dest: LoRaAddress,
        msg_type: u8,
        msg_id: u8,
        payload: &[u8],
        relay: bool,
    ) -> Result<(), NodeError> {
        let frames = self
            .inner
            .fragmenter
            .split(dest, msg_type, msg_id, relay, payload);
        debug!("Sending {}B to {} in {} fragment(s).", payload.len(), dest, frames.len());
        self.send_tracked(frames)
    }

    fn send_tracked(&self, frames: Vec<Frame>) -> Result<(), NodeError> {
        let Some(first) = frames.first() else {
            return Ok(());
        };
        let (dest, msg_id) = (first.dest, first.msg_id);
        let tracked = self.role() == Role::Base
            && dest != BROADCAST
            && MessageKind::from(first.msg_type).expects_reply();
        if tracked {
            self.inner.pending.lock().add(dest, msg_id);
        }
        let result = self.transmit(&frames);
        if result.is_err() && tracked {
            self.inner.pending.lock().remove(dest, msg_id);
        }
        result
    }

    fn transmit(&self, frames: &[Frame]) -> Result<(), NodeError> {
        let max_len = self.inner.config.max_frame_len;
        let delay = self.inner.config.fragment_delay();
        let _sending = self.inner.send_lock.lock();
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                thread::sleep(delay);
            }
            let bytes = frame.to_bytes(max_len)?;
            self.inner.link.lock().send_bytes(&bytes)?;
            trace!(
                "Sent type {} id {} to {} ({}B).",
                frame.msg_type,
                frame.msg_id,
                frame.dest,
                bytes.len()
            );
        }
        Ok(())
    }

    /// Pulls at most one packet from the link and handles it on the calling thread.
    /// Returns whether a packet was received.
    pub fn poll(&self) -> Result<bool, NodeError> {
        let received = self.inner.link.lock().receive_bytes()?;
        match received {
            Some(raw) => {
                if let Some(frame) = self.accept(raw) {
                    self.process(frame);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Decodes, routes and reassembles one packet. Returns a complete message to
    /// dispatch locally.
    fn accept(&self, raw: Vec<u8>) -> Option<Frame> {
        let frame = match Frame::try_from_bytes(&raw) {
            Ok(frame) => frame,
            Err(err) => {
                self.alert(&NodeError::from(err).to_string());
                return None;
            }
        };
        trace!(
            "Frame from {} to {}: type {}, id {}, {}B.",
            frame.src,
            frame.dest,
            frame.msg_type,
            frame.msg_id,
            frame.payload.len()
        );

        match self.inner.dispatcher.route(&frame, self.relay_enabled()) {
            Route::Local => {}
            Route::Relay => {
                self.relay(&frame, &raw);
                return None;
            }
            Route::Discard => {
                let err = NodeError::RoutingDiscard {
                    src: frame.src,
                    dest: frame.dest,
                };
                debug!("{}", err);
                self.alert(&err.to_string());
                return None;
            }
        }

        match self.inner.reassembler.lock().on_receive(frame, Instant::now()) {
            Ok(complete) => complete,
            Err(err) => {
                self.alert(&NodeError::from(err).to_string());
                None
            }
        }
    }

    /// Forwards a frame for another node unchanged, source included. Waits for any
    /// send in progress.
    fn relay(&self, frame: &Frame, raw: &[u8]) {
        info!("Relaying frame from {} to {}.", frame.src, frame.dest);
        self.inner
            .observer
            .on_message(&format!("Relaying message from {} to {}.", frame.src, frame.dest));
        let _sending = self.inner.send_lock.lock();
        if let Err(err) = self.inner.link.lock().send_bytes(raw) {
            self.alert(&format!("Relay to {} failed: {}", frame.dest, err));
        }
    }

    /// Dispatches a complete message and carries out the resulting actions.
    fn process(&self, frame: Frame) {
        let summary = match frame.payload_text() {
            Ok(text) if !frame.is_binary() => {
                format!("Received from {} to {}: {}", frame.src, frame.dest, text)
            }
            _ => format!(
                "Received {}B from {} to {}.",
                frame.payload.len(),
                frame.src,
                frame.dest
            ),
        };
        self.inner.observer.on_message(&summary);

        let result = self
            .inner
            .dispatcher
            .dispatch(&frame)
            .map_err(NodeError::from)
            .and_then(|actions| {
                actions
                    .into_iter()
                    .try_for_each(|action| self.execute(&frame, action))
            });
        if let Err(err) = result {
            self.report_failure(&frame, err);
        }
    }

    /// Alerts the application and, when the sender awaits a reply, answers with an
    /// error frame.
    fn report_failure(&self, frame: &Frame, err: NodeError) {
        self.alert(&format!(
            "Error processing type {} from {}: {}",
            frame.msg_type, frame.src, err
        ));
        if MessageKind::from(frame.msg_type).expects_reply() {
            let text = format!("Error: {}", err);
            let sent = self.send(frame.src, ResponseKind::Error.into(), frame.msg_id, &text, false);
            if let Err(err) = sent {
                error!("Could not answer error to {}: {}", frame.src, err);
            }
        }
    }

    fn alert(&self, text: &str) {
        self.inner.observer.on_alert(text);
    }

    /// Evicts the peers silent since `now - node_timeout`, with their pending requests.
    pub fn evict_expired(&self, now: Instant) -> Vec<LoRaAddress> {
        let expired = {
            let mut peers = self.inner.peers.lock();
            let expired = peers.expired(now);
            for addr in &expired {
                peers.evict(*addr);
            }
            expired
        };
        for addr in &expired {
            let forgotten = self.inner.pending.lock().forget(*addr);
            self.alert(&format!(
                "Node {} removed after timeout ({} pending request(s) dropped).",
                addr, forgotten
            ));
        }
        expired
    }

    /// Spawns the receive thread and the role's background workers.
    pub fn start(&self) -> Result<(), NodeError> {
        if !self.is_running() {
            return Err(LinkError::Closed.into());
        }
        let mut workers = self.inner.workers.lock();
        let node = self.clone();
        workers.start(WorkerKind::Receive, move |token| node.receive_loop(token));

        if self.role() == Role::Base {
            let node = self.clone();
            workers.start(WorkerKind::Watchdog, move |token| {
                while !token.wait(WATCHDOG_PERIOD) {
                    node.evict_expired(Instant::now());
                }
            });
            let node = self.clone();
            workers.start(WorkerKind::Ping, move |token| node.ping_loop(token));
        } else if self.inner.peripherals.sync_store.is_some() {
            let node = self.clone();
            workers.start(WorkerKind::SyncPush, move |token| node.sync_loop(token));
        }
        if self.inner.pending_media.is_some() && self.inner.peripherals.media_link.is_some() {
            let node = self.clone();
            workers.start(WorkerKind::MediaRetry, move |token| node.media_retry_loop(token));
        }
        info!("Node {} started.", self.address());
        Ok(())
    }

    /// Stops every worker and closes the link. A stopped node cannot be restarted.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.workers.lock().stop_all();
        self.inner.link.lock().close();
        info!("Node {} stopped.", self.address());
    }

    fn receive_loop(&self, token: StopToken) {
        let poll = self.inner.config.poll_interval();
        let backoff = self.inner.config.reconnect_backoff();
        while self.is_running() {
            let received = self.inner.link.lock().receive_bytes();
            match received {
                Ok(Some(raw)) => {
                    let Some(frame) = self.accept(raw) else {
                        continue;
                    };
                    let node = self.clone();
                    let spawned = thread::Builder::new()
                        .name("dispatch".to_owned())
                        .spawn(move || node.process(frame));
                    if let Err(err) = spawned {
                        warn!("Could not spawn dispatch thread: {}", err);
                    }
                }
                Ok(None) => {
                    if token.wait(poll) {
                        break;
                    }
                }
                Err(err) => {
                    if !self.is_running() {
                        break;
                    }
                    self.alert(&format!(
                        "Radio link failure: {}. Reconnecting in {:?}.",
                        err, backoff
                    ));
                    if token.wait(backoff) {
                        break;
                    }
                    match self.inner.link.lock().reconnect() {
                        Ok(()) => info!("Radio link reconnected."),
                        Err(err) => error!("Radio link reconnection failed: {}", err),
                    }
                }
            }
        }
        debug!("Receive loop finished.");
    }

    fn ping_loop(&self, token: StopToken) {
        let period = self.inner.config.ping_interval();
        loop {
            match self.send(BROADCAST, ControlCommand::Ping as u8, 0, "", false) {
                Ok(()) => debug!("Ping broadcast."),
                Err(err) => self.alert(&format!("Ping failed: {}", err)),
            }
            if token.wait(period) {
                break;
            }
        }
    }

    fn sync_loop(&self, token: StopToken) {
        let period = self.inner.config.sync_interval();
        while !token.wait(period) {
            if let Err(err) = self.push_sync_packet() {
                self.alert(&format!("Sync push failed: {}", err));
            }
        }
    }

    fn media_retry_loop(&self, token: StopToken) {
        let period = self.inner.config.media_retry_interval();
        while !token.wait(period) {
            if let Err(err) = self.retry_pending_media() {
                self.alert(&format!("Pending media retry failed: {}", err));
            }
        }
    }

    /// Sends the pending captures over the side-channel and clears the delivered ones.
    /// Returns how many were delivered.
    pub fn retry_pending_media(&self) -> Result<usize, NodeError> {
        let (Some(pending), Some(link)) = (
            self.inner.pending_media.as_ref(),
            self.inner.peripherals.media_link.as_ref(),
        ) else {
            return Ok(0);
        };
        let entries = pending.lock().list().to_vec();
        let mut delivered = 0;
        for entry in entries {
            if !entry.path.exists() {
                warn!("Pending media {} no longer exists, dropped.", entry.path.display());
                pending.lock().clear(&entry.path)?;
                continue;
            }
            let sent = link.lock().send_file(&entry.path, entry.video);
            match sent {
                Ok(()) => {
                    pending.lock().clear(&entry.path)?;
                    info!("Pending media delivered: {}", entry.path.display());
                    delivered += 1;
                }
                Err(err) => debug!("{} still undelivered: {}", entry.path.display(), err),
            }
        }
        Ok(delivered)
    }

    /// Broadcasts the next packet of unsynced records, if any.
    pub fn push_sync_packet(&self) -> Result<bool, NodeError> {
        let Some(store) = self.inner.peripherals.sync_store.as_ref() else {
            return Ok(false);
        };
        let packet = store.lock().next_packet()?;
        match packet {
            Some(packet) => {
                self.send(BROADCAST, 0, DataId::SyncPacket.into(), &packet, false)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
