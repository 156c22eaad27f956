use std::fmt::Debug;

/// Raw byte link to the radio module.
///
/// A transceiver knows nothing about framing: it moves whole packets in and out of
/// the radio. Implementations own their port exclusively, callers serialize
/// concurrent writers (see [Node](crate::node::Node)).
pub trait Transceiver: Send {
    /// Transmits one packet.
    fn send_bytes(&mut self, data: &[u8]) -> Result<(), LinkError>;

    /// Non-blocking poll for the next complete packet received since the last call.
    fn receive_bytes(&mut self) -> Result<Option<Vec<u8>>, LinkError>;

    /// Releases the underlying port. Later calls fail with [LinkError::Closed].
    fn close(&mut self);

    /// Reopens the link after a failure.
    fn reconnect(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    /// RSSI (dBm) of the last received packet, when the hardware reports it.
    fn last_rssi(&self) -> Option<i16> {
        None
    }
}

impl<T: Transceiver + ?Sized> Transceiver for Box<T> {
    fn send_bytes(&mut self, data: &[u8]) -> Result<(), LinkError> {
        (**self).send_bytes(data)
    }

    fn receive_bytes(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        (**self).receive_bytes()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn reconnect(&mut self) -> Result<(), LinkError> {
        (**self).reconnect()
    }

    fn last_rssi(&self) -> Option<i16> {
        (**self).last_rssi()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    #[error("Underlying I/O Error.")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Internal radio error. Context: {}", .context)]
    Radio { context: String },

    #[error("Packet is too big for the radio (is: {}B, max: {}B)!", .size, .max)]
    TooBigPacket { size: usize, max: usize },

    #[error("Link is closed.")]
    Closed,
}

impl LinkError {
    pub(crate) fn radio<E: Debug>(err: E) -> Self {
        LinkError::Radio {
            context: format!("{:?}", err),
        }
    }
}
