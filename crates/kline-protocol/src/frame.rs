//! KWP2000 Frame Encoding
//!
//! Frame layout on the wire:
//! - 1 byte: format header (`0x81` single payload byte, `0x80` explicit length)
//! - 1 byte: target address
//! - 1 byte: source address
//! - 1 byte: payload length (explicit-length form only)
//! - N bytes: payload
//! - 1 byte: checksum (8-bit sum of every preceding byte)

use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::KlineError;

/// Header for a frame carrying exactly one payload byte and no length field
pub const HEADER_SINGLE_BYTE: u8 = 0x81;
/// Header for a frame with an explicit length byte
pub const HEADER_EXPLICIT_LENGTH: u8 = 0x80;
/// Largest frame, header through checksum
pub const MAX_FRAME_LEN: usize = 16;
/// Header, target, source, length and checksum
pub const FRAME_OVERHEAD: usize = 5;
/// Largest payload that fits in one frame
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - FRAME_OVERHEAD;

/// Fixed-capacity byte buffer with a write cursor.
///
/// Storage is allocated inline; pushes past the capacity fail instead of writing
/// out of bounds.
#[derive(Clone, Copy)]
pub struct FrameBuffer<const N: usize> {
    storage: [u8; N],
    len: usize,
}

/// A full wire frame
pub type RawFrame = FrameBuffer<MAX_FRAME_LEN>;
/// A received or requested payload
pub type Payload = FrameBuffer<MAX_PAYLOAD_LEN>;

impl<const N: usize> FrameBuffer<N> {
    /// Create an empty buffer
    pub const fn new() -> Self {
        Self {
            storage: [0; N],
            len: 0,
        }
    }

    /// Build a buffer holding a copy of `bytes`
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KlineError> {
        let mut buf = Self::new();
        buf.extend_from_slice(bytes)?;
        Ok(buf)
    }

    /// Append one byte
    pub fn push(&mut self, byte: u8) -> Result<(), KlineError> {
        match self.storage.get_mut(self.len) {
            Some(slot) => {
                *slot = byte;
                self.len += 1;
                Ok(())
            }
            None => Err(KlineError::FrameOverflow {
                len: self.len + 1,
                capacity: N,
            }),
        }
    }

    /// Append a run of bytes, all or nothing
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), KlineError> {
        let end = self.len + bytes.len();
        if end > N {
            return Err(KlineError::FrameOverflow { len: end, capacity: N });
        }
        self.storage[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    /// Bytes written so far
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    /// Maximum number of bytes
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Free space left
    pub fn remaining(&self) -> usize {
        N - self.len
    }

    /// Reset the cursor
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl<const N: usize> Default for FrameBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Deref for FrameBuffer<N> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl<const N: usize> AsRef<[u8]> for FrameBuffer<N> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl<const N: usize> PartialEq for FrameBuffer<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<const N: usize> Eq for FrameBuffer<N> {}

impl<const N: usize> std::fmt::Debug for FrameBuffer<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, byte) in self.as_slice().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        write!(f, "]")
    }
}

/// Checksum of a byte run: sum of all bytes truncated to 8 bits
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Validate a checksum byte against the bytes it covers
pub fn verify_checksum(bytes: &[u8], expected: u8) -> Result<(), KlineError> {
    let actual = checksum(bytes);
    if actual != expected {
        Err(KlineError::ChecksumMismatch { expected, actual })
    } else {
        Ok(())
    }
}

/// The fixed address pair of one diagnostic link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressing {
    /// ECU (remote peer) address
    pub ecu: u8,
    /// Our own (tester) address
    pub host: u8,
}

impl Addressing {
    /// Create an address pair
    pub fn new(ecu: u8, host: u8) -> Self {
        Self { ecu, host }
    }

    /// Frame a request from the host to the ECU
    pub fn request_frame(&self, payload: &[u8]) -> Result<RawFrame, KlineError> {
        encode_frame(self.ecu, self.host, payload)
    }

    /// Frame a reply from the ECU to the host
    pub fn response_frame(&self, payload: &[u8]) -> Result<RawFrame, KlineError> {
        encode_frame(self.host, self.ecu, payload)
    }
}

impl Default for Addressing {
    fn default() -> Self {
        Self {
            ecu: 0x11,
            host: 0xF2,
        }
    }
}

/// Build a complete frame for `payload`.
///
/// A single payload byte uses the 5-byte `0x81` form; anything longer carries an
/// explicit length byte. Empty payloads and payloads above [`MAX_PAYLOAD_LEN`] are
/// rejected.
pub fn encode_frame(target: u8, source: u8, payload: &[u8]) -> Result<RawFrame, KlineError> {
    if payload.is_empty() {
        return Err(KlineError::InvalidRequest("empty payload".to_string()));
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(KlineError::InvalidRequest(format!(
            "payload of {} bytes exceeds {} byte limit",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }

    let mut frame = RawFrame::new();
    if payload.len() == 1 {
        frame.push(HEADER_SINGLE_BYTE)?;
        frame.push(target)?;
        frame.push(source)?;
    } else {
        frame.push(HEADER_EXPLICIT_LENGTH)?;
        frame.push(target)?;
        frame.push(source)?;
        frame.push(payload.len() as u8)?;
    }
    frame.extend_from_slice(payload)?;
    let sum = checksum(&frame);
    frame.push(sum)?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_read_register_frame() {
        let frame = Addressing::default().request_frame(&[0x21, 0x0C]).unwrap();
        let cs = (0x80u32 + 0x11 + 0xF2 + 0x02 + 0x21 + 0x0C) % 256;
        assert_eq!(frame.as_slice(), &[0x80, 0x11, 0xF2, 0x02, 0x21, 0x0C, cs as u8]);
    }

    #[test]
    fn test_single_byte_frame() {
        let frame = Addressing::default().request_frame(&[0x81]).unwrap();
        assert_eq!(frame.len(), 5);
        assert_eq!(&frame[..4], &[0x81, 0x11, 0xF2, 0x81]);
        assert_eq!(frame[4], checksum(&frame[..4]));
    }

    #[test]
    fn test_payload_limits() {
        let addr = Addressing::default();
        assert!(matches!(
            addr.request_frame(&[]),
            Err(KlineError::InvalidRequest(_))
        ));
        assert!(matches!(
            addr.request_frame(&[0u8; MAX_PAYLOAD_LEN + 1]),
            Err(KlineError::InvalidRequest(_))
        ));
        let full = addr.request_frame(&[0xAA; MAX_PAYLOAD_LEN]).unwrap();
        assert_eq!(full.len(), MAX_FRAME_LEN);
        assert_eq!(full.remaining(), 0);
    }

    #[test]
    fn test_buffer_rejects_overflow() {
        let mut buf = FrameBuffer::<2>::new();
        buf.push(1).unwrap();
        buf.push(2).unwrap();
        assert!(matches!(
            buf.push(3),
            Err(KlineError::FrameOverflow { len: 3, capacity: 2 })
        ));
        assert!(buf.extend_from_slice(&[9]).is_err());
        assert_eq!(buf.as_slice(), &[1, 2]);

        buf.clear();
        assert!(buf.is_empty());
        buf.push(1).unwrap();
        assert_eq!(buf, FrameBuffer::<2>::from_slice(&[1]).unwrap());
        assert!(FrameBuffer::<2>::from_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[]), 0x00);
        assert!(verify_checksum(&[0x50, 0x80], 0xD0).is_ok());
        assert!(matches!(
            verify_checksum(&[0x50, 0x80], 0xD1),
            Err(KlineError::ChecksumMismatch { expected: 0xD1, actual: 0xD0 })
        ));
    }

    proptest! {
        #[test]
        fn prop_checksum_is_sum_mod_256(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
            prop_assert_eq!(checksum(&bytes) as u32, sum % 256);
            prop_assert!(verify_checksum(&bytes, checksum(&bytes)).is_ok());
        }

        #[test]
        fn prop_single_bit_flip_fails(
            bytes in proptest::collection::vec(any::<u8>(), 1..32),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let cs = checksum(&bytes);
            let mut corrupted = bytes.clone();
            corrupted[index.index(bytes.len())] ^= 1 << bit;
            prop_assert!(verify_checksum(&corrupted, cs).is_err());
        }

        #[test]
        fn prop_frame_length(payload in proptest::collection::vec(any::<u8>(), 2..=MAX_PAYLOAD_LEN)) {
            let frame = Addressing::default().request_frame(&payload).unwrap();
            prop_assert_eq!(frame.len(), FRAME_OVERHEAD + payload.len());
            prop_assert_eq!(frame[3] as usize, payload.len());
            prop_assert_eq!(&frame[4..4 + payload.len()], payload.as_slice());
        }
    }
}
