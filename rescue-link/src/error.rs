use crate::device::frame::FrameError;
use crate::device::LinkError;
use crate::dispatch::HandlerError;
use crate::fragment::ReassemblyError;
use crate::peripherals::PeripheralError;
use crate::LoRaAddress;

/// Everything that can go wrong while running a node.
///
/// Errors raised while handling one inbound frame are reported through
/// [NodeObserver::on_alert](crate::observer::NodeObserver::on_alert) and never stop the
/// receive loop.
#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Radio link failure: {0}")]
    Link(#[from] LinkError),

    #[error("Frame from {} to {} is not for this node, discarded.", .src, .dest)]
    RoutingDiscard { src: LoRaAddress, dest: LoRaAddress },

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("{} link unavailable.", .0)]
    LinkUnavailable(&'static str),

    #[error("Stream {} from {} abandoned: {}", .msg_id, .sender, .reason)]
    ReassemblyAbandoned {
        sender: LoRaAddress,
        msg_id: u8,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Underlying I/O Error.")]
    Io(#[from] std::io::Error),
}

impl From<PeripheralError> for NodeError {
    fn from(err: PeripheralError) -> Self {
        match err {
            PeripheralError::Unavailable(what) => NodeError::LinkUnavailable(what),
            other => NodeError::Handler(HandlerError::Peripheral(other)),
        }
    }
}

impl From<ReassemblyError> for NodeError {
    fn from(err: ReassemblyError) -> Self {
        match err {
            ReassemblyError::Overflow { sender, msg_id, .. } => NodeError::ReassemblyAbandoned {
                sender,
                msg_id,
                reason: err.to_string(),
            },
        }
    }
}
