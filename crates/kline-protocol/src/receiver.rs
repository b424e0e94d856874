//! Frame Receiver State Machine
//!
//! Bytes arriving on the K-line are classified one at a time by [`transition`], a pure
//! function of the current [`RxState`], the byte and the link's [`Addressing`]. The
//! [`Receiver`] applies the resulting [`RxAction`] to its payload buffer.
//!
//! The line is half duplex, so everything the host sends comes back as an echo. Frames
//! are only returned when they target the host and come from the ECU; everything else,
//! including the echo, is checksum-tracked to its end and then dropped.

use tracing::{debug, trace};

use crate::error::KlineError;
use crate::frame::{Addressing, Payload, HEADER_EXPLICIT_LENGTH, MAX_PAYLOAD_LEN};

/// Length bits of an inline-length header
const INLINE_LENGTH_MASK: u8 = 0x3F;

/// How the header declared the payload length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthForm {
    /// A separate length byte follows the source address
    Explicit,
    /// Length carried in the header itself (`0x81` = one byte)
    Inline(u8),
}

/// Position in the frame grammar.
///
/// Every state after the header carries the running checksum of the bytes consumed so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    AwaitHeader,
    AwaitTarget { form: LengthForm, sum: u8 },
    AwaitSource { form: LengthForm, to_host: bool, sum: u8 },
    AwaitLength { for_me: bool, sum: u8 },
    AwaitData { remaining: u8, for_me: bool, sum: u8 },
    AwaitChecksum { for_me: bool, sum: u8 },
}

/// Side effect of consuming one byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxAction {
    /// Byte accounted for, nothing to report
    Consumed,
    /// Byte is not a known header and was dropped
    Rejected,
    /// Payload byte of a frame addressed to us
    Store(u8),
    /// Checksum verified on a frame addressed to us
    Complete,
    /// Checksum failed on a frame addressed to us
    ChecksumMismatch { expected: u8, actual: u8 },
    /// A frame addressed to us declares more payload than fits
    Oversized(u8),
    /// A frame for someone else ended and was dropped
    Foreign,
}

/// Classify the header byte
fn length_form(header: u8) -> Option<LengthForm> {
    match header {
        HEADER_EXPLICIT_LENGTH => Some(LengthForm::Explicit),
        0x81..=0xBF => Some(LengthForm::Inline(header & INLINE_LENGTH_MASK)),
        _ => None,
    }
}

/// Enter the payload section once the length is known
fn begin_payload(length: u8, for_me: bool, sum: u8) -> (RxState, RxAction) {
    if for_me && length as usize > MAX_PAYLOAD_LEN {
        return (RxState::AwaitHeader, RxAction::Oversized(length));
    }
    let next = if length == 0 {
        RxState::AwaitChecksum { for_me, sum }
    } else {
        RxState::AwaitData {
            remaining: length,
            for_me,
            sum,
        }
    };
    (next, RxAction::Consumed)
}

/// Advance the grammar by one byte
pub fn transition(state: RxState, byte: u8, addressing: &Addressing) -> (RxState, RxAction) {
    match state {
        RxState::AwaitHeader => match length_form(byte) {
            Some(form) => (RxState::AwaitTarget { form, sum: byte }, RxAction::Consumed),
            None => (RxState::AwaitHeader, RxAction::Rejected),
        },
        RxState::AwaitTarget { form, sum } => (
            RxState::AwaitSource {
                form,
                to_host: byte == addressing.host,
                sum: sum.wrapping_add(byte),
            },
            RxAction::Consumed,
        ),
        RxState::AwaitSource { form, to_host, sum } => {
            // A frame sourced from our own address is the line echo and never matches.
            let for_me = to_host && byte == addressing.ecu;
            let sum = sum.wrapping_add(byte);
            match form {
                LengthForm::Explicit => (RxState::AwaitLength { for_me, sum }, RxAction::Consumed),
                LengthForm::Inline(length) => begin_payload(length, for_me, sum),
            }
        }
        RxState::AwaitLength { for_me, sum } => begin_payload(byte, for_me, sum.wrapping_add(byte)),
        RxState::AwaitData {
            remaining,
            for_me,
            sum,
        } => {
            let sum = sum.wrapping_add(byte);
            let next = if remaining > 1 {
                RxState::AwaitData {
                    remaining: remaining - 1,
                    for_me,
                    sum,
                }
            } else {
                RxState::AwaitChecksum { for_me, sum }
            };
            let action = if for_me {
                RxAction::Store(byte)
            } else {
                RxAction::Consumed
            };
            (next, action)
        }
        RxState::AwaitChecksum { for_me, sum } => {
            let action = if !for_me {
                RxAction::Foreign
            } else if byte == sum {
                RxAction::Complete
            } else {
                RxAction::ChecksumMismatch {
                    expected: byte,
                    actual: sum,
                }
            };
            (RxState::AwaitHeader, action)
        }
    }
}

/// Incremental frame assembler for one link
#[derive(Debug, Clone)]
pub struct Receiver {
    addressing: Addressing,
    state: RxState,
    payload: Payload,
    foreign_frames: u32,
}

impl Receiver {
    /// Create a receiver waiting for a header
    pub fn new(addressing: Addressing) -> Self {
        Self {
            addressing,
            state: RxState::AwaitHeader,
            payload: Payload::new(),
            foreign_frames: 0,
        }
    }

    /// Current grammar position
    pub fn state(&self) -> RxState {
        self.state
    }

    /// Number of complete frames dropped because they were not addressed to us
    pub fn foreign_frames(&self) -> u32 {
        self.foreign_frames
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.state = RxState::AwaitHeader;
        self.payload.clear();
    }

    /// Consume one byte.
    ///
    /// Returns the payload once a frame addressed to us completes with a valid checksum,
    /// `Ok(None)` while more bytes are needed, and an error for a frame addressed to us
    /// that fails its checksum or does not fit.
    pub fn feed(&mut self, byte: u8) -> Result<Option<Payload>, KlineError> {
        let (next, action) = transition(self.state, byte, &self.addressing);
        trace!("rx {:02X}: {:?} -> {:?}", byte, self.state, next);
        self.state = next;

        match action {
            RxAction::Consumed => Ok(None),
            RxAction::Rejected => {
                trace!("Dropping unrecognised header byte {:02X}", byte);
                Ok(None)
            }
            RxAction::Store(data) => {
                self.payload.push(data)?;
                Ok(None)
            }
            RxAction::Complete => {
                let payload = self.payload;
                self.payload.clear();
                debug!("Received frame with payload {:?}", payload);
                Ok(Some(payload))
            }
            RxAction::ChecksumMismatch { expected, actual } => {
                self.payload.clear();
                Err(KlineError::ChecksumMismatch { expected, actual })
            }
            RxAction::Oversized(length) => {
                self.payload.clear();
                Err(KlineError::FrameOverflow {
                    len: length as usize,
                    capacity: MAX_PAYLOAD_LEN,
                })
            }
            RxAction::Foreign => {
                self.foreign_frames += 1;
                self.payload.clear();
                debug!("Discarded frame not addressed to us");
                Ok(None)
            }
        }
    }

    /// Feed a run of bytes, stopping at the first completed frame or error
    pub fn feed_all(&mut self, bytes: &[u8]) -> Result<Option<Payload>, KlineError> {
        for &byte in bytes {
            if let Some(payload) = self.feed(byte)? {
                return Ok(Some(payload));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{checksum, encode_frame, MAX_PAYLOAD_LEN};
    use proptest::prelude::*;

    fn addressing() -> Addressing {
        Addressing::default()
    }

    #[test]
    fn test_single_byte_frame_decodes() {
        let frame = addressing().response_frame(&[0x42]).unwrap();
        assert_eq!(frame.len(), 5);

        let mut rx = Receiver::new(addressing());
        let payload = rx.feed_all(&frame).unwrap().expect("frame should complete");
        assert_eq!(payload.as_slice(), &[0x42]);
        assert_eq!(rx.state(), RxState::AwaitHeader);
    }

    #[test]
    fn test_grammar_walk() {
        let addr = addressing();
        let frame = addr.response_frame(&[0x50, 0x80]).unwrap();
        let mut state = RxState::AwaitHeader;
        let mut actions = Vec::new();
        for &byte in frame.iter() {
            let (next, action) = transition(state, byte, &addr);
            state = next;
            actions.push(action);
        }
        assert_eq!(
            actions,
            vec![
                RxAction::Consumed,
                RxAction::Consumed,
                RxAction::Consumed,
                RxAction::Consumed,
                RxAction::Store(0x50),
                RxAction::Store(0x80),
                RxAction::Complete,
            ]
        );
        assert_eq!(state, RxState::AwaitHeader);
    }

    #[test]
    fn test_echo_is_not_for_me() {
        let addr = addressing();
        let echo = addr.request_frame(&[0x21, 0x0C]).unwrap();
        let reply = addr.response_frame(&[0x61, 0x0C, 0x12]).unwrap();

        let mut rx = Receiver::new(addr);
        assert_eq!(rx.feed_all(&echo).unwrap(), None);
        assert_eq!(rx.foreign_frames(), 1);
        let payload = rx.feed_all(&reply).unwrap().unwrap();
        assert_eq!(payload.as_slice(), &[0x61, 0x0C, 0x12]);
    }

    #[test]
    fn test_target_and_source_must_both_match() {
        let addr = addressing();
        // Right source, wrong target.
        let other_tester = encode_frame(0xF1, addr.ecu, &[0x61, 0x0C, 0x01]).unwrap();
        // Right target, wrong source.
        let other_ecu = encode_frame(addr.host, 0x12, &[0x61, 0x0C, 0x02]).unwrap();
        let good = addr.response_frame(&[0x61, 0x0C, 0x03]).unwrap();

        let mut rx = Receiver::new(addr);
        assert_eq!(rx.feed_all(&other_tester).unwrap(), None);
        assert_eq!(rx.feed_all(&other_ecu).unwrap(), None);
        assert_eq!(rx.foreign_frames(), 2);
        assert_eq!(rx.feed_all(&good).unwrap().unwrap().as_slice(), &[0x61, 0x0C, 0x03]);
    }

    #[test]
    fn test_foreign_frame_checksum_is_ignored() {
        let addr = addressing();
        let mut foreign = encode_frame(0xF1, 0x12, &[0x01, 0x02]).unwrap().as_slice().to_vec();
        let last = foreign.len() - 1;
        foreign[last] ^= 0xFF;

        let mut rx = Receiver::new(addr);
        assert_eq!(rx.feed_all(&foreign).unwrap(), None);
        assert_eq!(rx.state(), RxState::AwaitHeader);
    }

    #[test]
    fn test_checksum_mismatch_for_me() {
        let addr = addressing();
        let mut frame = addr.response_frame(&[0xC1, 0xEA, 0x8F]).unwrap().as_slice().to_vec();
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);

        let mut rx = Receiver::new(addr);
        let err = rx.feed_all(&frame).unwrap_err();
        assert!(matches!(err, KlineError::ChecksumMismatch { .. }));
        assert_eq!(rx.state(), RxState::AwaitHeader);
    }

    #[test]
    fn test_unknown_header_is_discarded() {
        // Noise ahead of the frame is dropped byte by byte.
        let addr = addressing();
        let frame = addr.response_frame(&[0x61, 0x0C, 0x7F]).unwrap();
        let mut bytes = vec![0x42, 0x00, 0xC0];
        bytes.extend_from_slice(&frame);

        let (state, action) = transition(RxState::AwaitHeader, 0x42, &addr);
        assert_eq!(state, RxState::AwaitHeader);
        assert_eq!(action, RxAction::Rejected);

        let mut rx = Receiver::new(addr);
        let payload = rx.feed_all(&bytes).unwrap().unwrap();
        assert_eq!(payload.as_slice(), &[0x61, 0x0C, 0x7F]);
    }

    #[test]
    fn test_inline_length_header() {
        let addr = addressing();
        let mut frame = vec![0x83, addr.host, addr.ecu, 0xC1, 0xEA, 0x8F];
        frame.push(checksum(&frame));

        let mut rx = Receiver::new(addr);
        let payload = rx.feed_all(&frame).unwrap().unwrap();
        assert_eq!(payload.as_slice(), &[0xC1, 0xEA, 0x8F]);
    }

    #[test]
    fn test_zero_length_frame() {
        let addr = addressing();
        let mut frame = vec![0x80, addr.host, addr.ecu, 0x00];
        frame.push(checksum(&frame));

        let mut rx = Receiver::new(addr);
        let payload = rx.feed_all(&frame).unwrap().unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_oversized_frame_for_me() {
        let addr = addressing();
        let frame = [0x80, addr.host, addr.ecu, (MAX_PAYLOAD_LEN + 1) as u8];

        let mut rx = Receiver::new(addr);
        let err = rx.feed_all(&frame).unwrap_err();
        assert!(matches!(err, KlineError::FrameOverflow { len: 12, .. }));
    }

    #[test]
    fn test_oversized_foreign_frame_is_skipped() {
        let addr = addressing();
        let mut foreign = vec![0x80, 0xF1, 0x12, 20];
        foreign.extend(std::iter::repeat(0x55).take(20));
        foreign.push(checksum(&foreign));
        let good = addr.response_frame(&[0x50, 0x80]).unwrap();

        let mut rx = Receiver::new(addr);
        assert_eq!(rx.feed_all(&foreign).unwrap(), None);
        assert_eq!(rx.feed_all(&good).unwrap().unwrap().as_slice(), &[0x50, 0x80]);
    }

    proptest! {
        #[test]
        fn prop_round_trip(payload in proptest::collection::vec(any::<u8>(), 1..=MAX_PAYLOAD_LEN)) {
            let addr = addressing();
            let frame = addr.response_frame(&payload).unwrap();
            let mut rx = Receiver::new(addr);
            let decoded = rx.feed_all(&frame).unwrap();
            prop_assert_eq!(decoded.map(|p| p.as_slice().to_vec()), Some(payload));
        }

        #[test]
        fn prop_payload_bit_flip_is_detected(
            payload in proptest::collection::vec(any::<u8>(), 2..=MAX_PAYLOAD_LEN),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let addr = addressing();
            let mut frame = addr.response_frame(&payload).unwrap().as_slice().to_vec();
            frame[4 + index.index(payload.len())] ^= 1 << bit;
            let mut rx = Receiver::new(addr);
            let is_mismatch = matches!(rx.feed_all(&frame), Err(KlineError::ChecksumMismatch { .. }));
            prop_assert!(is_mismatch);
        }
    }
}
