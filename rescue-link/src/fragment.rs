//! Splitting of payloads larger than one frame, and their reassembly.
//!
//! A stream is a run of frames sharing the sender, type and message id: every frame
//! but the last carries the continuation flag. The sender transmits them one at a
//! time (see [Node::send_fragmented](crate::node::Node::send_fragmented)), so they are
//! expected in order.
use log::{debug, warn};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::device::frame::{ControlFlags, Frame, FrameError, HEADER_LENGTH};
use crate::LoRaAddress;

/// Payload bytes per fragment, leaving room for the header under the 242B limit.
pub const DEFAULT_CHUNK_SIZE: usize = 200;
/// Largest stream kept in memory before it is abandoned.
pub const DEFAULT_STREAM_LIMIT: usize = 512 * 1024;
/// Concurrent streams tracked before the least recently fed one is dropped.
pub const DEFAULT_MAX_STREAMS: usize = 16;
/// Time a stream may go without a new fragment before it is dropped.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60);

/// Splits payloads into frames no larger than the radio accepts.
#[derive(Copy, Clone, Debug)]
pub struct Fragmenter {
    src: LoRaAddress,
    chunk_size: usize,
}

impl Fragmenter {
    /// Fails when `chunk_size` is zero or a full chunk plus the header exceeds `max_len`.
    pub fn new(src: LoRaAddress, chunk_size: usize, max_len: usize) -> Result<Self, FrameError> {
        if chunk_size == 0 || chunk_size + HEADER_LENGTH > max_len {
            return Err(FrameError::InvalidChunkSize {
                chunk: chunk_size,
                max: max_len,
            });
        }
        Ok(Self { src, chunk_size })
    }

    /// Ordered frames for `payload`: continuation frames of exactly `chunk_size` bytes,
    /// then one final frame with the remainder. An empty payload gives a single empty
    /// final frame.
    pub fn split(
        &self,
        dest: LoRaAddress,
        msg_type: u8,
        msg_id: u8,
        relay: bool,
        payload: &[u8],
    ) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(payload.len() / self.chunk_size + 1);
        let mut rest = payload;
        while rest.len() > self.chunk_size {
            let (chunk, tail) = rest.split_at(self.chunk_size);
            frames.push(
                Frame::binary(dest, self.src, msg_type, msg_id, chunk.to_vec(), true)
                    .with_relay(relay),
            );
            rest = tail;
        }
        frames.push(
            Frame::binary(dest, self.src, msg_type, msg_id, rest.to_vec(), false)
                .with_relay(relay),
        );
        frames
    }
}

/// Identifies an inbound stream. Text and binary runs of the same type and id are
/// kept apart.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub sender: LoRaAddress,
    pub msg_type: u8,
    pub msg_id: u8,
    pub binary: bool,
}

impl StreamKey {
    pub fn of(frame: &Frame) -> Self {
        Self {
            sender: frame.src,
            msg_type: frame.msg_type,
            msg_id: frame.msg_id,
            binary: frame.is_binary(),
        }
    }
}

struct Stream {
    bytes: Vec<u8>,
    updated: Instant,
}

/// Accumulates inbound fragments until the final one arrives.
///
/// A stream whose final fragment was lost is dropped once it has not been fed for
/// `max_idle`, so it never prefixes a later message reusing the same id.
pub struct Reassembler {
    streams: LruCache<StreamKey, Stream>,
    limit: usize,
    max_idle: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STREAMS, DEFAULT_STREAM_LIMIT, DEFAULT_MAX_IDLE)
    }
}

impl Reassembler {
    pub fn new(max_streams: usize, limit: usize, max_idle: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_streams).unwrap_or(NonZeroUsize::MIN);
        Self {
            streams: LruCache::new(capacity),
            limit,
            max_idle,
        }
    }

    /// Feeds one frame received at `now`.
    ///
    /// Returns the completed stream as a single frame (header fields of the final
    /// fragment, whole payload) once a frame without the continuation flag arrives.
    ///
    /// A final frame with no stream in progress is a complete single-frame payload.
    pub fn on_receive(
        &mut self,
        mut frame: Frame,
        now: Instant,
    ) -> Result<Option<Frame>, ReassemblyError> {
        self.drop_idle(now);
        let key = StreamKey::of(&frame);
        let buffered = self.buffered(&key);
        let size = buffered + frame.payload.len();
        if size > self.limit {
            self.streams.pop(&key);
            return Err(ReassemblyError::Overflow {
                sender: key.sender,
                msg_id: key.msg_id,
                size,
                limit: self.limit,
            });
        }

        if frame.is_continuation() {
            if let Some(stream) = self.streams.get_mut(&key) {
                stream.bytes.extend_from_slice(&frame.payload);
                stream.updated = now;
            } else {
                let stream = Stream {
                    bytes: frame.payload,
                    updated: now,
                };
                if let Some((stale, dropped)) = self.streams.push(key, stream) {
                    warn!(
                        "Abandoned stream {} from {} ({}B) to make room for a new one.",
                        stale.msg_id,
                        stale.sender,
                        dropped.bytes.len()
                    );
                }
            }
            debug!(
                "Buffered fragment of stream {} from {} ({}B so far).",
                key.msg_id, key.sender, size
            );
            return Ok(None);
        }

        if let Some(mut stream) = self.streams.pop(&key) {
            stream.bytes.extend_from_slice(&frame.payload);
            frame.payload = stream.bytes;
        }
        frame.control.remove(ControlFlags::CONTINUATION);
        Ok(Some(frame))
    }

    /// Drops the streams not fed since `now - max_idle`, returns how many.
    pub fn drop_idle(&mut self, now: Instant) -> usize {
        let max_idle = self.max_idle;
        let idle: Vec<StreamKey> = self
            .streams
            .iter()
            .filter(|(_, stream)| now.saturating_duration_since(stream.updated) > max_idle)
            .map(|(key, _)| *key)
            .collect();
        for key in &idle {
            if let Some(stream) = self.streams.pop(key) {
                warn!(
                    "Stream {} from {} idle for over {:?}, {}B dropped.",
                    key.msg_id,
                    key.sender,
                    max_idle,
                    stream.bytes.len()
                );
            }
        }
        idle.len()
    }

    /// Drops a stream in progress, returns whether one existed.
    pub fn discard(&mut self, key: &StreamKey) -> bool {
        self.streams.pop(key).is_some()
    }

    /// Bytes buffered for a stream in progress.
    pub fn buffered(&self, key: &StreamKey) -> usize {
        self.streams.peek(key).map_or(0, |stream| stream.bytes.len())
    }

    /// Number of streams in progress.
    pub fn in_progress(&self) -> usize {
        self.streams.len()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("Stream {} from {} exceeds {}B (is: {}B), discarded.", .msg_id, .sender, .limit, .size)]
    Overflow {
        sender: LoRaAddress,
        msg_id: u8,
        size: usize,
        limit: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::frame::MAX_FRAME_LENGTH;
    use proptest::prelude::*;

    const CHUNK: usize = 200;

    fn key(sender: LoRaAddress, msg_id: u8) -> StreamKey {
        StreamKey {
            sender,
            msg_type: 0,
            msg_id,
            binary: true,
        }
    }

    fn fragmenter() -> Fragmenter {
        Fragmenter::new(2, CHUNK, MAX_FRAME_LENGTH).unwrap()
    }

    fn reassemble(frames: Vec<Frame>) -> Vec<Frame> {
        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        frames
            .into_iter()
            .filter_map(|f| reassembler.on_receive(f, now).unwrap())
            .collect()
    }

    #[test]
    fn exact_multiple_gives_three_frames() {
        let payload: Vec<u8> = (0..600).map(|i| i as u8).collect();
        let frames = fragmenter().split(1, 0, 30, false, &payload);
        let sizes: Vec<usize> = frames.iter().map(|f| f.payload.len()).collect();
        assert_eq!(sizes, vec![200, 200, 200]);
        assert!(frames[0].is_continuation() && frames[1].is_continuation());
        assert!(!frames[2].is_continuation());
        let done = reassemble(frames);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload, payload);
    }

    #[test]
    fn remainder_goes_in_final_frame() {
        let payload = vec![7u8; 650];
        let frames = fragmenter().split(1, 0, 30, false, &payload);
        let sizes: Vec<usize> = frames.iter().map(|f| f.payload.len()).collect();
        assert_eq!(sizes, vec![200, 200, 200, 50]);
        assert_eq!(frames.iter().filter(|f| f.is_continuation()).count(), 3);
        assert_eq!(reassemble(frames)[0].payload, payload);
    }

    #[test]
    fn edge_lengths_reassemble_exactly() {
        for len in [0, CHUNK - 1, CHUNK, CHUNK + 1, 5 * CHUNK + 3] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31) as u8).collect();
            let frames = fragmenter().split(1, 0, 30, true, &payload);
            assert!(frames.iter().all(|f| f.relay && f.is_binary()));
            assert!(frames.iter().all(|f| f.payload.len() <= CHUNK));
            let done = reassemble(frames);
            assert_eq!(done.len(), 1, "len {}", len);
            assert_eq!(done[0].payload, payload, "len {}", len);
            assert_eq!(done[0].src, 2);
        }
    }

    #[test]
    fn invalid_chunk_sizes_are_refused() {
        assert!(Fragmenter::new(2, 0, MAX_FRAME_LENGTH).is_err());
        assert!(Fragmenter::new(2, MAX_FRAME_LENGTH - HEADER_LENGTH + 1, MAX_FRAME_LENGTH).is_err());
        assert!(Fragmenter::new(2, MAX_FRAME_LENGTH - HEADER_LENGTH, MAX_FRAME_LENGTH).is_ok());
    }

    #[test]
    fn lone_final_frame_is_complete() {
        let mut reassembler = Reassembler::default();
        let frame = Frame::binary(1, 9, 0, 30, vec![1, 2, 3], false);
        let done = reassembler.on_receive(frame.clone(), Instant::now()).unwrap().unwrap();
        assert_eq!(done, frame);
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn interrupted_stream_never_completes() {
        let mut reassembler = Reassembler::default();
        let key = key(9, 30);
        for _ in 0..4 {
            let frame = Frame::binary(1, 9, 0, 30, vec![0; 100], true);
            assert_eq!(reassembler.on_receive(frame, Instant::now()).unwrap(), None);
        }
        assert_eq!(reassembler.buffered(&key), 400);
        assert!(reassembler.discard(&key));
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn oversized_stream_is_abandoned() {
        let mut reassembler = Reassembler::new(4, 250, DEFAULT_MAX_IDLE);
        let first = Frame::binary(1, 9, 0, 30, vec![0; 200], true);
        assert_eq!(reassembler.on_receive(first, Instant::now()).unwrap(), None);
        let second = Frame::binary(1, 9, 0, 30, vec![0; 200], true);
        assert_eq!(
            reassembler.on_receive(second, Instant::now()),
            Err(ReassemblyError::Overflow {
                sender: 9,
                msg_id: 30,
                size: 400,
                limit: 250
            })
        );
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn streams_are_kept_apart() {
        let mut reassembler = Reassembler::default();
        let a = Frame::binary(1, 9, 0, 30, vec![1; 10], true);
        let b = Frame::binary(1, 8, 0, 30, vec![2; 10], true);
        let c = Frame::binary(1, 9, 0, 31, vec![3; 10], true);
        for f in [a, b, c] {
            assert_eq!(reassembler.on_receive(f, Instant::now()).unwrap(), None);
        }
        let end = Frame::binary(1, 8, 0, 30, vec![2; 5], false);
        let done = reassembler.on_receive(end, Instant::now()).unwrap().unwrap();
        assert_eq!(done.payload, vec![2; 15]);
        assert_eq!(reassembler.in_progress(), 2);
    }

    #[test]
    fn least_recent_stream_is_dropped_when_full() {
        let mut reassembler = Reassembler::new(2, DEFAULT_STREAM_LIMIT, DEFAULT_MAX_IDLE);
        for sender in 1..=3 {
            let frame = Frame::binary(1, sender, 0, 30, vec![0; 10], true);
            reassembler.on_receive(frame, Instant::now()).unwrap();
        }
        assert_eq!(reassembler.in_progress(), 2);
        assert_eq!(reassembler.buffered(&key(1, 30)), 0);
    }

    #[test]
    fn stale_stream_does_not_prefix_other_replies() {
        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        let lost_photo = Frame::binary(2, 1, 0, 7, vec![0xFF, 0xD8, 0xFF, 0x00], true);
        assert_eq!(reassembler.on_receive(lost_photo, now).unwrap(), None);

        let caps = Frame::text(2, 1, 2, 7, "1010");
        let done = reassembler.on_receive(caps.clone(), now).unwrap().unwrap();
        assert_eq!(done, caps);

        let line = Frame::text(2, 1, 0, 7, "21.0,30.0");
        let done = reassembler.on_receive(line.clone(), now).unwrap().unwrap();
        assert_eq!(done, line);
        assert_eq!(reassembler.buffered(&key(1, 7)), 4);
    }

    #[test]
    fn idle_stream_is_dropped() {
        let mut reassembler = Reassembler::new(4, DEFAULT_STREAM_LIMIT, Duration::from_secs(5));
        let start = Instant::now();
        let first = Frame::binary(2, 1, 0, 30, vec![0xFF, 0xD8, 0xFF, 0x00], true);
        assert_eq!(reassembler.on_receive(first, start).unwrap(), None);
        let more = Frame::binary(2, 1, 0, 30, vec![1; 10], true);
        let fed = start + Duration::from_secs(4);
        assert_eq!(reassembler.on_receive(more, fed).unwrap(), None);
        assert_eq!(reassembler.drop_idle(start + Duration::from_secs(8)), 0);

        let retry = Frame::binary(2, 1, 0, 30, vec![0x89, b'P'], false);
        let done = reassembler
            .on_receive(retry, fed + Duration::from_secs(6))
            .unwrap()
            .unwrap();
        assert_eq!(done.payload, vec![0x89, b'P']);
        assert_eq!(reassembler.in_progress(), 0);
    }

    proptest! {
        #[test]
        fn split_then_reassemble(
            payload in proptest::collection::vec(any::<u8>(), 0..2_000),
            chunk in 1usize..=(MAX_FRAME_LENGTH - HEADER_LENGTH),
        ) {
            let fragmenter = Fragmenter::new(2, chunk, MAX_FRAME_LENGTH).unwrap();
            let frames = fragmenter.split(1, 0, 30, false, &payload);
            for frame in &frames {
                prop_assert!(frame.to_bytes(MAX_FRAME_LENGTH).is_ok());
            }
            let done = reassemble(frames);
            prop_assert_eq!(done.len(), 1);
            prop_assert_eq!(&done[0].payload, &payload);
        }
    }
}
