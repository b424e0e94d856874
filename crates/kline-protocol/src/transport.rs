//! Line Driver Abstractions
//!
//! The protocol engine only needs byte I/O on the K-line, a millisecond clock and a
//! blocking delay. Pin control is needed for the fast-init wake-up pulse alone.

use serde::{Deserialize, Serialize};

use crate::error::KlineError;

/// Half-duplex serial channel plus timing primitives
pub trait Transport {
    /// Transmit a complete frame
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), KlineError>;

    /// Number of received bytes waiting to be read
    fn bytes_available(&mut self) -> Result<usize, KlineError>;

    /// Read one received byte. Only called after `bytes_available` reported data.
    fn read_byte(&mut self) -> Result<u8, KlineError>;

    /// Monotonic millisecond counter
    fn now_millis(&self) -> u64;

    /// Block for `ms` milliseconds
    fn sleep_millis(&mut self, ms: u64);

    /// Detach the UART from the line so the pins can be driven directly
    fn release(&mut self) -> Result<(), KlineError>;

    /// Re-attach the UART at the given baud rate
    fn reconfigure(&mut self, baud_rate: u32) -> Result<(), KlineError>;
}

/// Pin direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinMode {
    Input,
    Output,
}

/// Logic level driven on an output pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinLevel {
    Low,
    High,
}

/// Digital I/O on the K-line transceiver pins
pub trait Gpio {
    /// Set a pin's direction
    fn set_pin_mode(&mut self, pin: u8, mode: PinMode) -> Result<(), KlineError>;

    /// Drive an output pin
    fn set_pin_level(&mut self, pin: u8, level: PinLevel) -> Result<(), KlineError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), KlineError> {
        (**self).write_bytes(bytes)
    }

    fn bytes_available(&mut self) -> Result<usize, KlineError> {
        (**self).bytes_available()
    }

    fn read_byte(&mut self) -> Result<u8, KlineError> {
        (**self).read_byte()
    }

    fn now_millis(&self) -> u64 {
        (**self).now_millis()
    }

    fn sleep_millis(&mut self, ms: u64) {
        (**self).sleep_millis(ms)
    }

    fn release(&mut self) -> Result<(), KlineError> {
        (**self).release()
    }

    fn reconfigure(&mut self, baud_rate: u32) -> Result<(), KlineError> {
        (**self).reconfigure(baud_rate)
    }
}

impl<G: Gpio + ?Sized> Gpio for &mut G {
    fn set_pin_mode(&mut self, pin: u8, mode: PinMode) -> Result<(), KlineError> {
        (**self).set_pin_mode(pin, mode)
    }

    fn set_pin_level(&mut self, pin: u8, level: PinLevel) -> Result<(), KlineError> {
        (**self).set_pin_level(pin, level)
    }
}
