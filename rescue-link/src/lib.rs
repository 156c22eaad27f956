//! Point-to-point LoRa messaging for a search-and-rescue robot and its base station.
//!
//! The crate layers a compact addressed protocol on top of a half-duplex radio
//! transceiver: a 7-byte header codec ([frame]), fragmentation of large payloads
//! ([fragment]), request/response correlation ([pending]), routing and dispatch over
//! message type bands ([dispatch]) and the [Node](node::Node) runtime that ties them to a
//! [Transceiver](device::Transceiver).

pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod fragment;
pub mod media;
pub mod message;
pub mod node;
pub mod observer;
pub mod peripherals;
pub mod pending;
pub mod telemetry;
pub mod worker;

pub use device::frame;
pub use error::NodeError;
pub use node::Node;

/// Address of a node on the radio network.
pub type LoRaAddress = u16;

/// Address reserved for frames every node must handle.
pub const BROADCAST: LoRaAddress = 0xFFFF;

/// Destination of a frame, as seen by routing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LoRaDestination {
    Global,
    Unique(LoRaAddress),
}

impl From<LoRaAddress> for LoRaDestination {
    fn from(addr: LoRaAddress) -> Self {
        if addr == BROADCAST {
            LoRaDestination::Global
        } else {
            LoRaDestination::Unique(addr)
        }
    }
}
