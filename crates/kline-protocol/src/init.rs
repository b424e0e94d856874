//! ISO 14230-2 Fast Init
//!
//! Wakes the ECU with a timed pulse on the TX line instead of a 5-baud address byte,
//! then hands the line back to the UART at 10400 baud. The two-step negotiation that
//! follows (Start Communication, Start Diagnostic Session) is driven by the client
//! through the normal request path; this module holds the pulse and the reply checks.

use tracing::debug;

use crate::config::{FastInitTiming, LinePins};
use crate::error::{HandshakeStep, KlineError};
use crate::frame::Payload;
use crate::service;
use crate::transport::{Gpio, PinLevel, PinMode, Transport};

/// Start Communication request
pub const START_COMMUNICATION: [u8; 1] = [service::START_COMMUNICATION];
/// Positive reply to Start Communication, with the ECU's key bytes
pub const START_COMMUNICATION_OK: [u8; 3] = [0xC1, 0xEA, 0x8F];
/// Start Diagnostic Session request
pub const START_DIAGNOSTIC_SESSION: [u8; 2] = [service::START_DIAGNOSTIC_SESSION, 0x80];
/// Positive reply to Start Diagnostic Session
pub const START_DIAGNOSTIC_SESSION_OK: [u8; 2] = [0x50, 0x80];

/// Wake-up pulse generator
#[derive(Debug, Clone, Copy)]
pub struct FastInit {
    timing: FastInitTiming,
    pins: LinePins,
}

impl FastInit {
    /// Create a sequencer for the given timing and pins
    pub fn new(timing: FastInitTiming, pins: LinePins) -> Self {
        Self { timing, pins }
    }

    /// Drive the wake-up pattern and re-attach the UART.
    ///
    /// High for `idle_high_ms`, low for `low_ms`, high for `high_ms`, then the serial
    /// driver is reconfigured at the session baud rate.
    pub fn wake<L: Transport + Gpio>(&self, line: &mut L) -> Result<(), KlineError> {
        let FastInitTiming {
            idle_high_ms,
            low_ms,
            high_ms,
            baud_rate,
        } = self.timing;

        line.release()?;
        line.set_pin_mode(self.pins.rx, PinMode::Input)?;
        line.set_pin_mode(self.pins.tx, PinMode::Output)?;

        debug!(
            "Fast init pulse: high {}ms, low {}ms, high {}ms",
            idle_high_ms, low_ms, high_ms
        );
        line.set_pin_level(self.pins.tx, PinLevel::High)?;
        line.sleep_millis(idle_high_ms);
        line.set_pin_level(self.pins.tx, PinLevel::Low)?;
        line.sleep_millis(low_ms);
        line.set_pin_level(self.pins.tx, PinLevel::High)?;
        line.sleep_millis(high_ms);

        line.reconfigure(baud_rate)
    }
}

/// Check the reply to one handshake step.
///
/// `reply` is the outcome of the request; a transport-level failure (timeout,
/// checksum) is reported as a rejection of that step.
pub fn verify_reply(
    step: HandshakeStep,
    reply: Result<Payload, KlineError>,
) -> Result<(), KlineError> {
    let expected: &[u8] = match step {
        HandshakeStep::StartCommunication => &START_COMMUNICATION_OK,
        HandshakeStep::StartDiagnosticSession => &START_DIAGNOSTIC_SESSION_OK,
    };
    match reply {
        Ok(payload) if payload.as_slice() == expected => Ok(()),
        Ok(payload) => Err(KlineError::HandshakeRejected {
            step,
            detail: format!("expected {:02X?}, got {:?}", expected, payload),
        }),
        Err(err) => Err(KlineError::HandshakeRejected {
            step,
            detail: err.to_string(),
        }),
    }
}
