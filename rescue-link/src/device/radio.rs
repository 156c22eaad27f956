use embedded_hal::blocking::delay::DelayMs;
use log::{debug, trace, warn};
use radio::{Receive, ReceiveInfo, Transmit};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use super::device::{LinkError, Transceiver};
use super::frame::MAX_LORA_PAYLOAD;

const TX_POLL_DELAY_MS: u32 = 10;
const TX_TIMEOUT: Duration = Duration::from_secs(5);

/// Radio physical device representation.
///
/// Any chip driver implementing the `radio` HAL traits (SX127x, SX126x over SPI...)
/// and a blocking delay can be driven as a [Transceiver].
pub trait Radio<E>: Transmit<Error = E> + Receive<Error = E> + DelayMs<u32> {}

impl<E, T> Radio<E> for T where T: Transmit<Error = E> + Receive<Error = E> + DelayMs<u32> {}

/// Transceiver implementation for a LoRa radio chip.
///
/// The chip is half-duplex: it is put back in reception right after every
/// transmission and stays there between polls.
pub struct LoRaRadio<T, E>
where
    T: Radio<E>,
    E: Debug,
{
    radio: T,
    listening: bool,
    closed: bool,
    last_rssi: Option<i16>,
    phantom: PhantomData<fn() -> E>,
}

impl<T, E> LoRaRadio<T, E>
where
    T: Radio<E>,
    E: Debug,
{
    /// Initialize a new LoRa radio as transceiver.
    pub fn new(radio: T) -> Self {
        Self {
            radio,
            listening: false,
            closed: false,
            last_rssi: None,
            phantom: PhantomData,
        }
    }

    pub fn into_inner(self) -> T {
        self.radio
    }

    fn start_reception(&mut self) -> Result<(), LinkError> {
        self.radio.start_receive().map_err(LinkError::radio)?;
        self.listening = true;
        Ok(())
    }
}

impl<T, E> Transceiver for LoRaRadio<T, E>
where
    T: Radio<E> + Send,
    E: Debug,
{
    fn send_bytes(&mut self, data: &[u8]) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        if data.len() > MAX_LORA_PAYLOAD {
            return Err(LinkError::TooBigPacket {
                size: data.len(),
                max: MAX_LORA_PAYLOAD,
            });
        }
        self.listening = false;
        trace!("Transmission on air ({}B).", data.len());
        self.radio.start_transmit(data).map_err(LinkError::radio)?;
        let started = Instant::now();
        while !self.radio.check_transmit().map_err(LinkError::radio)? {
            if started.elapsed() > TX_TIMEOUT {
                warn!("Transmission did not complete in {:?}.", TX_TIMEOUT);
                return Err(LinkError::Radio {
                    context: format!("transmission timed out after {:?}", TX_TIMEOUT),
                });
            }
            self.radio.delay_ms(TX_POLL_DELAY_MS);
        }
        debug!("Transmission successful, back to reception.");
        self.start_reception()
    }

    fn receive_bytes(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        if !self.listening {
            self.start_reception()?;
        }
        if !self.radio.check_receive(true).map_err(LinkError::radio)? {
            return Ok(None);
        }
        let mut buf = [0u8; MAX_LORA_PAYLOAD + 1];
        let (size, info) = self.radio.get_received(&mut buf).map_err(LinkError::radio)?;
        self.last_rssi = Some(info.rssi());
        // Some drivers leave the chip idle after a read.
        self.start_reception()?;
        if size == 0 {
            trace!("Packet ignored: size == 0");
            return Ok(None);
        }
        let size = size.min(buf.len());
        debug!("Received an incoming LoRa packet ({}B, rssi: {}).", size, info.rssi());
        Ok(Some(buf[..size].to_vec()))
    }

    fn close(&mut self) {
        self.closed = true;
        self.listening = false;
    }

    fn reconnect(&mut self) -> Result<(), LinkError> {
        self.closed = false;
        self.start_reception()
    }

    fn last_rssi(&self) -> Option<i16> {
        self.last_rssi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Default, Clone)]
    struct Info(i16);

    impl ReceiveInfo for Info {
        fn rssi(&self) -> i16 {
            self.0
        }
    }

    #[derive(Default)]
    struct MockRadio {
        sent: Vec<Vec<u8>>,
        inbound: VecDeque<Vec<u8>>,
        tx_polls: usize,
        receive_starts: usize,
    }

    impl Transmit for MockRadio {
        type Error = ();

        fn start_transmit(&mut self, data: &[u8]) -> Result<(), Self::Error> {
            self.sent.push(data.to_vec());
            self.tx_polls = 2;
            Ok(())
        }

        fn check_transmit(&mut self) -> Result<bool, Self::Error> {
            if self.tx_polls == 0 {
                return Ok(true);
            }
            self.tx_polls -= 1;
            Ok(false)
        }
    }

    impl Receive for MockRadio {
        type Error = ();
        type Info = Info;

        fn start_receive(&mut self) -> Result<(), Self::Error> {
            self.receive_starts += 1;
            Ok(())
        }

        fn check_receive(&mut self, _restart: bool) -> Result<bool, Self::Error> {
            Ok(!self.inbound.is_empty())
        }

        fn get_received(&mut self, buff: &mut [u8]) -> Result<(usize, Self::Info), Self::Error> {
            let packet = self.inbound.pop_front().ok_or(())?;
            buff[..packet.len()].copy_from_slice(&packet);
            Ok((packet.len(), Info(-87)))
        }
    }

    impl DelayMs<u32> for MockRadio {
        fn delay_ms(&mut self, _ms: u32) {}
    }

    #[test]
    fn transmit_waits_then_listens() {
        let mut device = LoRaRadio::new(MockRadio::default());
        device.send_bytes(&[1, 2, 3]).unwrap();
        let radio = device.into_inner();
        assert_eq!(radio.sent, vec![vec![1, 2, 3]]);
        assert_eq!(radio.receive_starts, 1);
    }

    #[test]
    fn receive_reports_rssi() {
        let mut radio = MockRadio::default();
        radio.inbound.push_back(vec![9; 12]);
        let mut device = LoRaRadio::new(radio);
        assert_eq!(device.last_rssi(), None);
        assert_eq!(device.receive_bytes().unwrap(), Some(vec![9; 12]));
        assert_eq!(device.last_rssi(), Some(-87));
        assert_eq!(device.receive_bytes().unwrap(), None);
    }

    #[test]
    fn oversized_packet_is_refused() {
        let mut device = LoRaRadio::new(MockRadio::default());
        let err = device.send_bytes(&[0; MAX_LORA_PAYLOAD + 1]).unwrap_err();
        assert!(matches!(err, LinkError::TooBigPacket { .. }));
    }

    #[test]
    fn closed_radio_refuses_io() {
        let mut device = LoRaRadio::new(MockRadio::default());
        device.close();
        assert!(matches!(device.send_bytes(&[1]), Err(LinkError::Closed)));
        device.reconnect().unwrap();
        device.send_bytes(&[1]).unwrap();
    }
}
