//! K-Line Diagnostic Client
//!
//! Owns the line, runs the fast-init handshake and performs paced, timed
//! request/response transactions with one ECU.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::KlineConfig;
use crate::error::{ErrorCode, HandshakeStep, KlineError};
use crate::frame::{Addressing, Payload};
use crate::init::{self, FastInit, START_COMMUNICATION, START_DIAGNOSTIC_SESSION};
use crate::receiver::Receiver;
use crate::service::{NEGATIVE_RESPONSE, POSITIVE_RESPONSE_OFFSET, READ_DATA_BY_LOCAL_ID};
use crate::transport::{Gpio, Transport};

/// Link lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No handshake attempted yet
    Uninitialized,
    /// Fast init in progress
    Handshaking,
    /// Handshake accepted, requests may be sent
    Ready,
    /// Last handshake failed
    Faulted,
}

/// Diagnostic client for one ECU on a K-line
pub struct KlineClient<T> {
    /// Line driver
    transport: T,
    /// Link configuration
    config: KlineConfig,
    /// Address pair taken from the config
    addressing: Addressing,
    /// Current link state
    state: LinkState,
    /// Outcome of the most recent operation
    last_error: ErrorCode,
    /// Time of the last transmitted request
    last_request_ms: Option<u64>,
}

impl<T: Transport> KlineClient<T> {
    /// Create a client over `transport`.
    ///
    /// Fails if the configuration is inconsistent.
    pub fn new(transport: T, config: KlineConfig) -> Result<Self, KlineError> {
        config.validate()?;
        info!(
            "Creating K-line client: ECU {:02X}, host {:02X}",
            config.ecu_address, config.host_address
        );

        Ok(Self {
            transport,
            addressing: config.addressing(),
            config,
            state: LinkState::Uninitialized,
            last_error: ErrorCode::Ok,
            last_request_ms: None,
        })
    }

    /// Current link state
    pub fn link_state(&self) -> LinkState {
        self.state
    }

    /// Code of the most recent failure, `ErrorCode::Ok` after a success
    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    /// Link configuration
    pub fn config(&self) -> &KlineConfig {
        &self.config
    }

    /// Borrow the line driver
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the line driver
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give back the line driver
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Send one request and wait for the ECU's reply payload
    pub fn request(&mut self, payload: &[u8]) -> Result<Payload, KlineError> {
        let result = self.transact(payload);
        self.record(result)
    }

    /// Read a register by local identifier, returning its data bytes
    pub fn read_register(&mut self, register: u8) -> Result<Vec<u8>, KlineError> {
        let result = self
            .transact(&[READ_DATA_BY_LOCAL_ID, register])
            .and_then(|reply| parse_register_reply(register, &reply));
        self.record(result)
    }

    /// Read a register into `buf`.
    ///
    /// Copies at most `buf.len()` data bytes and returns how many were copied; 0 on any
    /// failure, with the reason left in [`last_error`](Self::last_error).
    pub fn request_register(&mut self, register: u8, buf: &mut [u8]) -> usize {
        match self.read_register(register) {
            Ok(data) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                n
            }
            Err(_) => 0,
        }
    }

    /// Store the outcome of an operation as the last error
    fn record<R>(&mut self, result: Result<R, KlineError>) -> Result<R, KlineError> {
        self.last_error = match &result {
            Ok(_) => ErrorCode::Ok,
            Err(e) => {
                warn!("K-line operation failed: {}", e);
                e.code()
            }
        };
        result
    }

    /// Frame, pace, send and receive one transaction
    fn transact(&mut self, payload: &[u8]) -> Result<Payload, KlineError> {
        let frame = self.addressing.request_frame(payload)?;

        self.wait_for_gap();
        debug!("Sending frame {:?}", frame);
        self.transport.write_bytes(&frame)?;
        self.last_request_ms = Some(self.transport.now_millis());

        self.receive()
    }

    /// Block until the quiet period since the previous request has elapsed
    fn wait_for_gap(&mut self) {
        let Some(last) = self.last_request_ms else {
            return;
        };
        let gap = self.config.timing.request_gap_ms;
        let elapsed = self.transport.now_millis().saturating_sub(last);
        if elapsed < gap {
            debug!("Pacing request by {}ms", gap - elapsed);
            self.transport.sleep_millis(gap - elapsed);
        }
    }

    /// Poll the line until a frame for us completes or the line stays silent too long.
    ///
    /// The silence timer restarts with every received byte, foreign frames included.
    fn receive(&mut self) -> Result<Payload, KlineError> {
        let timing = self.config.timing;
        let mut receiver = Receiver::new(self.addressing);
        let mut last_byte_ms = self.transport.now_millis();

        loop {
            let idle = self.transport.now_millis().saturating_sub(last_byte_ms);
            if idle >= timing.response_timeout_ms {
                debug!(
                    "No response after {}ms ({} foreign frames seen)",
                    idle,
                    receiver.foreign_frames()
                );
                return Err(KlineError::Timeout(idle));
            }

            self.transport.sleep_millis(timing.byte_poll_ms);

            let available = self.transport.bytes_available()?;
            for _ in 0..available {
                let byte = self.transport.read_byte()?;
                last_byte_ms = self.transport.now_millis();
                if let Some(payload) = receiver.feed(byte)? {
                    return Ok(payload);
                }
            }
        }
    }
}

impl<T: Transport + Gpio> KlineClient<T> {
    /// Wake the ECU and open a diagnostic session.
    ///
    /// No retry is attempted; on failure the link is left `Faulted` and the caller
    /// decides whether to try again.
    pub fn fast_init(&mut self) -> Result<(), KlineError> {
        info!("Starting fast init");
        self.state = LinkState::Handshaking;

        let result = self.handshake();
        self.state = if result.is_ok() {
            info!("ECU {:02X} ready", self.addressing.ecu);
            LinkState::Ready
        } else {
            LinkState::Faulted
        };
        self.record(result)
    }

    /// Run fast init, reporting only success or failure
    pub fn init_pulse(&mut self) -> bool {
        self.fast_init().is_ok()
    }

    fn handshake(&mut self) -> Result<(), KlineError> {
        FastInit::new(self.config.fast_init, self.config.pins).wake(&mut self.transport)?;

        let reply = self.transact(&START_COMMUNICATION);
        init::verify_reply(HandshakeStep::StartCommunication, reply)?;
        debug!("Start Communication accepted");

        let reply = self.transact(&START_DIAGNOSTIC_SESSION);
        init::verify_reply(HandshakeStep::StartDiagnosticSession, reply)
    }
}

/// Extract the data bytes of a read-by-local-id reply
fn parse_register_reply(register: u8, reply: &[u8]) -> Result<Vec<u8>, KlineError> {
    match reply {
        [NEGATIVE_RESPONSE, service, code, ..] => Err(KlineError::NegativeResponse {
            service: *service,
            code: *code,
        }),
        [sid, reg, data @ ..]
            if *sid == READ_DATA_BY_LOCAL_ID + POSITIVE_RESPONSE_OFFSET
                && *reg == register
                && !data.is_empty() =>
        {
            Ok(data.to_vec())
        }
        _ => Err(KlineError::UnexpectedResponse(format!(
            "register {:02X} read returned {:02X?}",
            register, reply
        ))),
    }
}
