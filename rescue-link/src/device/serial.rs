//! UART LoRa modules (SX126x boards in transparent mode).
//!
//! The module transmits whatever it is written as one packet and writes every received
//! packet as one burst on the UART. Packets are delimited on reception by the idle gap
//! that follows each burst, and the terminator appended by the sender is stripped.
//! Terminator bytes inside a binary payload are therefore harmless.
use log::{debug, info, trace};
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use super::device::{LinkError, Transceiver};
use super::frame::MAX_LORA_PAYLOAD;

/// Sequence appended to every transmitted packet.
pub const TERMINATOR: &[u8] = b"\n\r";
/// Silence on the UART marking the end of a packet.
pub const IDLE_GAP: Duration = Duration::from_millis(100);
/// Bursts longer than this are cut, two packets glued together are never valid.
const MAX_BURST: usize = 2 * MAX_LORA_PAYLOAD;

pub struct SerialTransceiver {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransceiver {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, LinkError> {
        let mut transceiver = Self {
            path: path.to_owned(),
            baud_rate,
            port: None,
        };
        transceiver.reconnect()?;
        Ok(transceiver)
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, LinkError> {
        self.port.as_mut().ok_or(LinkError::Closed)
    }
}

impl Transceiver for SerialTransceiver {
    fn send_bytes(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let port = self.port()?;
        port.write_all(data)?;
        port.write_all(TERMINATOR)?;
        port.flush()?;
        trace!("Sent {}B on {}.", data.len(), self.path);
        Ok(())
    }

    fn receive_bytes(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        let port = self.port()?;
        if port.bytes_to_read()? == 0 {
            return Ok(None);
        }
        let mut packet = Vec::with_capacity(MAX_LORA_PAYLOAD + TERMINATOR.len());
        let mut buf = [0u8; 64];
        while packet.len() < MAX_BURST {
            match port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => packet.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == ErrorKind::TimedOut => break,
                Err(err) => return Err(err.into()),
            }
        }
        let packet = strip_terminator(packet);
        if packet.is_empty() {
            return Ok(None);
        }
        debug!("Received {}B on {}.", packet.len(), self.path);
        Ok(Some(packet))
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed serial port {}.", self.path);
        }
    }

    fn reconnect(&mut self) -> Result<(), LinkError> {
        self.port = None;
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(IDLE_GAP)
            .open()?;
        port.clear(serialport::ClearBuffer::Input)?;
        info!("Opened serial port {} at {} bauds.", self.path, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }
}

/// Removes the terminator appended by the sending module, if present.
pub fn strip_terminator(mut packet: Vec<u8>) -> Vec<u8> {
    if packet.ends_with(TERMINATOR) {
        packet.truncate(packet.len() - TERMINATOR.len());
    }
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_is_stripped_once() {
        assert_eq!(strip_terminator(b"abc\n\r".to_vec()), b"abc".to_vec());
        assert_eq!(strip_terminator(b"abc\n\r\n\r".to_vec()), b"abc\n\r".to_vec());
    }

    #[test]
    fn packet_without_terminator_is_kept() {
        assert_eq!(strip_terminator(b"a\nb".to_vec()), b"a\nb".to_vec());
        assert!(strip_terminator(TERMINATOR.to_vec()).is_empty());
    }

    #[test]
    fn missing_port_fails_to_open() {
        assert!(SerialTransceiver::open("/dev/does-not-exist-rescue", 9600).is_err());
    }
}
