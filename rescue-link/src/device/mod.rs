//! Everything needed to establish communication between peers using the physical
//! radio module.

pub mod device;
pub mod frame;
pub mod loopback;
pub mod radio;
pub mod serial;

pub use device::*;
