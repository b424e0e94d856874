//! Simulated K-Line
//!
//! A transport with a virtual clock for exercising the protocol engine without
//! hardware. Time only moves when the engine sleeps, so timeouts and pacing are
//! deterministic. Writes are echoed back like on a real half-duplex line, and each
//! write releases the next scripted ECU reply.

use std::collections::VecDeque;

use tracing::debug;

use crate::error::KlineError;
use crate::frame::{checksum, Addressing, HEADER_EXPLICIT_LENGTH, HEADER_SINGLE_BYTE};
use crate::transport::{Gpio, PinLevel, PinMode, Transport};

/// Delay between a request and the first reply byte unless overridden
pub const DEFAULT_REPLY_DELAY_MS: u64 = 25;

/// Pin activity recorded by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinEvent {
    Mode { at_ms: u64, pin: u8, mode: PinMode },
    Level { at_ms: u64, pin: u8, level: PinLevel },
}

/// A frame written by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Virtual time of the write
    pub at_ms: u64,
    /// Bytes put on the line
    pub bytes: Vec<u8>,
}

/// Bytes the simulated ECU sends after a request
#[derive(Debug, Clone)]
struct ScriptedReply {
    bytes: Vec<u8>,
    delay_ms: u64,
    byte_gap_ms: u64,
}

/// Virtual-clock K-line with a scripted ECU
#[derive(Debug, Clone)]
pub struct MockLine {
    addressing: Addressing,
    now_ms: u64,
    echo: bool,
    rx: VecDeque<(u64, u8)>,
    replies: VecDeque<ScriptedReply>,
    writes: Vec<WriteRecord>,
    pin_events: Vec<PinEvent>,
    baud_rate: Option<u32>,
    released: bool,
}

impl MockLine {
    /// Line for the default ECU/host address pair, with echo enabled
    pub fn new() -> Self {
        Self::with_addressing(Addressing::default())
    }

    /// Line for a specific address pair
    pub fn with_addressing(addressing: Addressing) -> Self {
        Self {
            addressing,
            now_ms: 0,
            echo: true,
            rx: VecDeque::new(),
            replies: VecDeque::new(),
            writes: Vec::new(),
            pin_events: Vec::new(),
            baud_rate: None,
            released: false,
        }
    }

    /// Disable the half-duplex echo of written bytes
    pub fn without_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Frame `payload` as the ECU would send it to the host.
    ///
    /// No length limit is applied so oversized frames can be simulated.
    pub fn ecu_frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = if payload.len() == 1 {
            vec![HEADER_SINGLE_BYTE, self.addressing.host, self.addressing.ecu]
        } else {
            vec![
                HEADER_EXPLICIT_LENGTH,
                self.addressing.host,
                self.addressing.ecu,
                payload.len() as u8,
            ]
        };
        frame.extend_from_slice(payload);
        frame.push(checksum(&frame));
        frame
    }

    /// Answer the next request with a well-formed frame carrying `payload`
    pub fn reply(&mut self, payload: &[u8]) -> &mut Self {
        let bytes = self.ecu_frame(payload);
        self.reply_raw(bytes)
    }

    /// Answer the next request with arbitrary bytes
    pub fn reply_raw(&mut self, bytes: Vec<u8>) -> &mut Self {
        self.reply_timed(bytes, DEFAULT_REPLY_DELAY_MS, 0)
    }

    /// Answer the next request with arbitrary bytes, after `delay_ms`, spacing each
    /// byte `byte_gap_ms` apart
    pub fn reply_timed(&mut self, bytes: Vec<u8>, delay_ms: u64, byte_gap_ms: u64) -> &mut Self {
        self.replies.push_back(ScriptedReply {
            bytes,
            delay_ms,
            byte_gap_ms,
        });
        self
    }

    /// Leave the next request unanswered
    pub fn silence(&mut self) -> &mut Self {
        self.reply_raw(Vec::new())
    }

    /// Make bytes available immediately, independent of any request
    pub fn inject(&mut self, bytes: &[u8]) {
        let now = self.now_ms;
        self.schedule(bytes.iter().map(|&b| (now, b)));
    }

    /// Frames written so far
    pub fn writes(&self) -> &[WriteRecord] {
        &self.writes
    }

    /// Pin activity so far
    pub fn pin_events(&self) -> &[PinEvent] {
        &self.pin_events
    }

    /// Baud rate of the last reconfigure
    pub fn baud_rate(&self) -> Option<u32> {
        self.baud_rate
    }

    /// Whether the UART was released for the wake-up pulse
    pub fn was_released(&self) -> bool {
        self.released
    }

    /// Bytes scheduled but not yet read, due or not
    pub fn pending_bytes(&self) -> usize {
        self.rx.len()
    }

    /// Replies scripted but not yet released by a request
    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    fn schedule(&mut self, bytes: impl IntoIterator<Item = (u64, u8)>) {
        self.rx.extend(bytes);
        self.rx.make_contiguous().sort_by_key(|&(at, _)| at);
    }
}

impl Default for MockLine {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockLine {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), KlineError> {
        let now = self.now_ms;
        self.writes.push(WriteRecord {
            at_ms: now,
            bytes: bytes.to_vec(),
        });
        if self.echo {
            self.schedule(bytes.iter().map(|&b| (now, b)));
        }
        if let Some(reply) = self.replies.pop_front() {
            debug!("Mock ECU replying with {} bytes", reply.bytes.len());
            let start = now + reply.delay_ms;
            let gap = reply.byte_gap_ms;
            self.schedule(
                reply
                    .bytes
                    .into_iter()
                    .enumerate()
                    .map(|(i, b)| (start + i as u64 * gap, b)),
            );
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, KlineError> {
        let now = self.now_ms;
        Ok(self.rx.iter().take_while(|&&(at, _)| at <= now).count())
    }

    fn read_byte(&mut self) -> Result<u8, KlineError> {
        match self.rx.front() {
            Some(&(at, byte)) if at <= self.now_ms => {
                self.rx.pop_front();
                Ok(byte)
            }
            _ => Err(KlineError::SerialError("no byte available".to_string())),
        }
    }

    fn now_millis(&self) -> u64 {
        self.now_ms
    }

    fn sleep_millis(&mut self, ms: u64) {
        self.now_ms += ms;
    }

    fn release(&mut self) -> Result<(), KlineError> {
        self.released = true;
        self.rx.clear();
        Ok(())
    }

    fn reconfigure(&mut self, baud_rate: u32) -> Result<(), KlineError> {
        self.baud_rate = Some(baud_rate);
        Ok(())
    }
}

impl Gpio for MockLine {
    fn set_pin_mode(&mut self, pin: u8, mode: PinMode) -> Result<(), KlineError> {
        self.pin_events.push(PinEvent::Mode {
            at_ms: self.now_ms,
            pin,
            mode,
        });
        Ok(())
    }

    fn set_pin_level(&mut self, pin: u8, level: PinLevel) -> Result<(), KlineError> {
        self.pin_events.push(PinEvent::Level {
            at_ms: self.now_ms,
            pin,
            level,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_and_reply_timing() {
        let mut line = MockLine::new();
        line.reply_timed(vec![1, 2, 3], 10, 5);
        line.write_bytes(&[0xAA]).unwrap();

        assert_eq!(line.bytes_available().unwrap(), 1);
        assert_eq!(line.read_byte().unwrap(), 0xAA);
        assert_eq!(line.bytes_available().unwrap(), 0);
        assert!(line.read_byte().is_err());

        line.sleep_millis(15);
        assert_eq!(line.bytes_available().unwrap(), 2);
        line.sleep_millis(5);
        assert_eq!(line.bytes_available().unwrap(), 3);
        assert_eq!(line.pending_replies(), 0);
    }

    #[test]
    fn test_ecu_frame_matches_codec() {
        let line = MockLine::new();
        let addr = Addressing::default();
        for payload in [&[0x50][..], &[0x61, 0x0C, 0x12, 0x34][..]] {
            let expected = addr.response_frame(payload).unwrap();
            assert_eq!(line.ecu_frame(payload), expected.as_slice());
        }
    }
}
