//! Frame codec.
//!
//! A frame is a fixed 7-byte header followed by the payload:
//!
//! ```text
//!  0       2       4         5                  6        7
//! +-------+-------+---------+------------------+--------+------------
//! | dest  | src   | control | relay(1)|type(7) | msg_id | payload ...
//! +-------+-------+---------+------------------+--------+------------
//! ```
//!
//! Addresses are big-endian. The control byte carries the binary and continuation
//! flags, its other bits are reserved and always written as zero. The frame is not
//! checksummed, the radio module already drops packets with a bad CRC.
use bitflags::bitflags;
use std::str::Utf8Error;

use crate::{LoRaAddress, LoRaDestination, BROADCAST};

/// Size of the fixed header in bytes.
pub const HEADER_LENGTH: usize = 7;
/// Largest frame (header + payload) accepted by the SX126x UART modules.
pub const MAX_FRAME_LENGTH: usize = 242;
/// Largest frame any supported radio can carry.
pub const MAX_LORA_PAYLOAD: usize = 255;

pub const RELAY_BITMASK: u8 = 0b1000_0000;
pub const TYPE_BITMASK: u8 = 0b0111_1111;

/// Trait to calculate size on frame for every component on frame.
pub trait FrameSize {
    /// Calculate component size on frame (meaning encoded) in bytes.
    fn size(&self) -> usize;
}

bitflags! {
    /// Fragmentation and encoding flags of the control byte.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ControlFlags: u8 {
        /// Payload is raw bytes, not UTF-8 text.
        const BINARY = 0b0000_0001;
        /// More fragments of the same stream follow this one.
        const CONTINUATION = 0b0000_0010;
    }
}

/// Compact representation of the relay flag and the message type.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TypeHeader(u8);

impl TypeHeader {
    /// Types above 127 are truncated to their low 7 bits.
    pub fn new(msg_type: u8, relay: bool) -> Self {
        let mut inner = msg_type & TYPE_BITMASK;
        if relay {
            inner |= RELAY_BITMASK;
        }
        Self(inner)
    }

    pub fn get_type(&self) -> u8 {
        self.0 & TYPE_BITMASK
    }

    pub fn get_relay(&self) -> bool {
        (self.0 & RELAY_BITMASK) == RELAY_BITMASK
    }
}

impl From<u8> for TypeHeader {
    fn from(inner: u8) -> Self {
        TypeHeader(inner)
    }
}

impl From<TypeHeader> for u8 {
    fn from(header: TypeHeader) -> Self {
        header.0
    }
}

/// Full representation of a radio frame with its header fields and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub dest: LoRaAddress,
    pub src: LoRaAddress,
    pub control: ControlFlags,
    /// Relay flag carried in the top bit of the type byte.
    pub relay: bool,
    /// Message type, 0 to 127.
    pub msg_type: u8,
    /// Identifier correlating requests, replies and fragments of a stream.
    pub msg_id: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a text frame (the only or final fragment of its stream).
    pub fn text(
        dest: LoRaAddress,
        src: LoRaAddress,
        msg_type: u8,
        msg_id: u8,
        text: &str,
    ) -> Self {
        Self {
            dest,
            src,
            control: ControlFlags::empty(),
            relay: false,
            msg_type: msg_type & TYPE_BITMASK,
            msg_id,
            payload: text.as_bytes().to_vec(),
        }
    }

    /// Builds a binary frame, flagged as continuation when more fragments follow.
    pub fn binary(
        dest: LoRaAddress,
        src: LoRaAddress,
        msg_type: u8,
        msg_id: u8,
        data: Vec<u8>,
        continuation: bool,
    ) -> Self {
        let mut control = ControlFlags::BINARY;
        control.set(ControlFlags::CONTINUATION, continuation);
        Self {
            dest,
            src,
            control,
            relay: false,
            msg_type: msg_type & TYPE_BITMASK,
            msg_id,
            payload: data,
        }
    }

    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    pub fn is_binary(&self) -> bool {
        self.control.contains(ControlFlags::BINARY)
    }

    pub fn is_continuation(&self) -> bool {
        self.control.contains(ControlFlags::CONTINUATION)
    }

    pub fn destination(&self) -> LoRaDestination {
        self.dest.into()
    }

    /// Payload as UTF-8 text.
    pub fn payload_text(&self) -> Result<&str, FrameError> {
        Ok(std::str::from_utf8(&self.payload)?)
    }

    /// Encodes the frame, refusing anything larger than `max_len` bytes.
    ///
    /// Oversized payloads are never truncated: callers must fragment them with
    /// [Fragmenter::split](crate::fragment::Fragmenter::split) instead.
    pub fn to_bytes(&self, max_len: usize) -> Result<Vec<u8>, FrameError> {
        let size = self.size();
        if size > max_len {
            return Err(FrameError::FrameTooLarge { size, max: max_len });
        }
        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(&self.dest.to_be_bytes());
        bytes.extend_from_slice(&self.src.to_be_bytes());
        bytes.push(self.control.bits());
        bytes.push(TypeHeader::new(self.msg_type, self.relay).into());
        bytes.push(self.msg_id);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Decodes a raw buffer. Reserved control bits are ignored.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LENGTH {
            return Err(FrameError::FrameTooShort { size: bytes.len() });
        }
        let (header, payload) = bytes.split_at(HEADER_LENGTH);
        let type_header = TypeHeader::from(header[5]);
        Ok(Frame {
            dest: u16::from_be_bytes([header[0], header[1]]),
            src: u16::from_be_bytes([header[2], header[3]]),
            control: ControlFlags::from_bits_truncate(header[4]),
            relay: type_header.get_relay(),
            msg_type: type_header.get_type(),
            msg_id: header[6],
            payload: payload.to_vec(),
        })
    }
}

impl FrameSize for Frame {
    fn size(&self) -> usize {
        HEADER_LENGTH + self.payload.len()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame is too short to hold a header (is: {}B, min: {}B).", .size, HEADER_LENGTH)]
    FrameTooShort { size: usize },

    #[error("Frame is too big to be transmitted (is: {}B, max: {}B), it must be fragmented.", .size, .max)]
    FrameTooLarge { size: usize, max: usize },

    #[error("Payload is not valid UTF-8 text.")]
    Decode(#[from] Utf8Error),

    #[error("Chunk size {} does not fit in a {}B frame.", .chunk, .max)]
    InvalidChunkSize { chunk: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_layout() {
        let frame = Frame::text(0x0102, 0x0304, 5, 7, "hi").with_relay(true);
        let bytes = frame.to_bytes(MAX_FRAME_LENGTH).unwrap();
        assert_eq!(bytes, vec![0x01, 0x02, 0x03, 0x04, 0x00, 0x85, 0x07, b'h', b'i']);
    }

    #[test]
    fn binary_control_bits() {
        let last = Frame::binary(1, 2, 0, 30, vec![1, 2, 3], false);
        let more = Frame::binary(1, 2, 0, 30, vec![1, 2, 3], true);
        assert_eq!(last.to_bytes(MAX_FRAME_LENGTH).unwrap()[4], 0x01);
        assert_eq!(more.to_bytes(MAX_FRAME_LENGTH).unwrap()[4], 0x03);
    }

    #[test]
    fn reserved_control_bits_are_ignored() {
        let raw = [0, 1, 0, 2, 0b1111_0010, 0, 0];
        let frame = Frame::try_from_bytes(&raw).unwrap();
        assert!(frame.is_continuation());
        assert!(!frame.is_binary());
    }

    #[test]
    fn type_above_band_is_masked() {
        let header = TypeHeader::new(0xFF, false);
        assert_eq!(header.get_type(), 0x7F);
        assert!(!header.get_relay());
    }

    #[test]
    fn oversized_frame_is_refused() {
        let frame = Frame::binary(1, 2, 0, 0, vec![0; MAX_FRAME_LENGTH - HEADER_LENGTH + 1], false);
        assert_eq!(
            frame.to_bytes(MAX_FRAME_LENGTH),
            Err(FrameError::FrameTooLarge {
                size: MAX_FRAME_LENGTH + 1,
                max: MAX_FRAME_LENGTH
            })
        );
        let exact = Frame::binary(1, 2, 0, 0, vec![0; MAX_FRAME_LENGTH - HEADER_LENGTH], false);
        assert_eq!(exact.to_bytes(MAX_FRAME_LENGTH).unwrap().len(), MAX_FRAME_LENGTH);
    }

    #[test]
    fn empty_payload_is_valid() {
        let frame = Frame::try_from_bytes(&[0xFF, 0xFF, 0, 1, 0, 5, 0]).unwrap();
        assert_eq!(frame.destination(), LoRaDestination::Global);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn invalid_text_is_a_decode_error() {
        let frame = Frame::binary(1, 2, 0, 0, vec![0xC3, 0x28], false);
        assert!(matches!(frame.payload_text(), Err(FrameError::Decode(_))));
    }

    proptest! {
        #[test]
        fn round_trip(
            dest in any::<u16>(),
            src in any::<u16>(),
            msg_type in 0u8..=127,
            msg_id in any::<u8>(),
            relay in any::<bool>(),
            binary in any::<bool>(),
            continuation in any::<bool>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=(MAX_FRAME_LENGTH - HEADER_LENGTH)),
        ) {
            let mut control = ControlFlags::empty();
            control.set(ControlFlags::BINARY, binary);
            control.set(ControlFlags::CONTINUATION, continuation);
            let frame = Frame { dest, src, control, relay, msg_type, msg_id, payload };
            let bytes = frame.to_bytes(MAX_FRAME_LENGTH).unwrap();
            prop_assert_eq!(Frame::try_from_bytes(&bytes).unwrap(), frame);
        }

        #[test]
        fn size_guard(extra in 1usize..64) {
            let payload = vec![0u8; MAX_FRAME_LENGTH - HEADER_LENGTH + extra];
            let frame = Frame::binary(1, 2, 0, 0, payload, false);
            let refused = matches!(frame.to_bytes(MAX_FRAME_LENGTH), Err(FrameError::FrameTooLarge { .. }));
            prop_assert!(refused);
        }

        #[test]
        fn short_buffers_are_rejected(raw in proptest::collection::vec(any::<u8>(), 0..HEADER_LENGTH)) {
            prop_assert_eq!(
                Frame::try_from_bytes(&raw),
                Err(FrameError::FrameTooShort { size: raw.len() })
            );
        }
    }
}
