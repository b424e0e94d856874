//! K-Line Diagnostic Protocol Implementation
//!
//! This crate talks KWP2000 over a single-wire K-line (ISO 14230) with one ECU.
//! It wakes the ECU with the fast-init pulse, frames requests with header, addresses
//! and checksum, and reassembles replies byte by byte from a noisy shared line.
//!
//! The engine is synchronous and generic over [`Transport`]; [`SerialTransport`]
//! drives a USB "KKL" adapter and [`MockLine`] simulates an ECU on a virtual clock.
//! [`KlineHandle`] puts a client behind an async, cloneable front end.

mod client;
mod config;
mod error;
mod frame;
mod handle;
mod init;
pub mod mock;
mod receiver;
mod serial;
mod transport;

pub use client::{KlineClient, LinkState};
pub use config::{FastInitTiming, KlineConfig, LinePins, Timing, MIN_BYTE_POLL_MS};
pub use error::{ErrorCode, HandshakeStep, KlineError};
pub use frame::{
    checksum, encode_frame, verify_checksum, Addressing, FrameBuffer, Payload, RawFrame,
    FRAME_OVERHEAD, HEADER_EXPLICIT_LENGTH, HEADER_SINGLE_BYTE, MAX_FRAME_LEN, MAX_PAYLOAD_LEN,
};
pub use handle::{KlineHandle, KlineWorker};
pub use init::{
    verify_reply, FastInit, START_COMMUNICATION, START_COMMUNICATION_OK, START_DIAGNOSTIC_SESSION,
    START_DIAGNOSTIC_SESSION_OK,
};
pub use mock::MockLine;
pub use receiver::{transition, LengthForm, Receiver, RxAction, RxState};
pub use serial::SerialTransport;
pub use transport::{Gpio, PinLevel, PinMode, Transport};

/// KWP2000 service identifiers
pub mod service {
    /// Start communication
    pub const START_COMMUNICATION: u8 = 0x81;
    /// Start diagnostic session
    pub const START_DIAGNOSTIC_SESSION: u8 = 0x10;
    /// Read data by local identifier
    pub const READ_DATA_BY_LOCAL_ID: u8 = 0x21;
    /// Negative response
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
    /// Positive responses echo the service id with this bit set
    pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
}
