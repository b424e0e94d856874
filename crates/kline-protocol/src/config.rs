//! K-Line Link Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::KlineError;
use crate::frame::Addressing;

/// Shortest poll delay known to work with slow ECUs (7ms passes on the bench, 6ms fails)
pub const MIN_BYTE_POLL_MS: u64 = 8;

/// Receive and pacing timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Delay between checks for received bytes (milliseconds)
    pub byte_poll_ms: u64,
    /// Minimum quiet time between two transmitted requests (milliseconds)
    pub request_gap_ms: u64,
    /// Give up after this long without any received byte (milliseconds)
    pub response_timeout_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            byte_poll_ms: MIN_BYTE_POLL_MS,
            request_gap_ms: 30,
            response_timeout_ms: 5000,
        }
    }
}

impl Timing {
    /// Response timeout as a duration
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Fast-init wake-up pulse timing.
///
/// ECUs check these windows tightly; the defaults are the ISO 14230-2 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastInitTiming {
    /// Idle-high time before the pulse (milliseconds)
    pub idle_high_ms: u64,
    /// Low phase of the wake-up pattern (milliseconds)
    pub low_ms: u64,
    /// High phase of the wake-up pattern (milliseconds)
    pub high_ms: u64,
    /// Line speed after the pulse
    pub baud_rate: u32,
}

impl Default for FastInitTiming {
    fn default() -> Self {
        Self {
            idle_high_ms: 300,
            low_ms: 25,
            high_ms: 25,
            baud_rate: 10400,
        }
    }
}

/// Transceiver pin numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinePins {
    /// UART receive pin
    pub rx: u8,
    /// UART transmit pin, driven directly during the wake-up pulse
    pub tx: u8,
}

impl Default for LinePins {
    fn default() -> Self {
        Self { rx: 0, tx: 1 }
    }
}

/// Configuration for one K-line diagnostic link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KlineConfig {
    /// ECU address
    pub ecu_address: u8,
    /// Tester (host) address
    pub host_address: u8,
    /// Receive and pacing timing
    pub timing: Timing,
    /// Wake-up pulse timing
    pub fast_init: FastInitTiming,
    /// Transceiver pins
    pub pins: LinePins,
}

impl Default for KlineConfig {
    fn default() -> Self {
        Self {
            ecu_address: 0x11,
            host_address: 0xF2,
            timing: Timing::default(),
            fast_init: FastInitTiming::default(),
            pins: LinePins::default(),
        }
    }
}

impl KlineConfig {
    /// Config for a given address pair, default timing
    pub fn with_addresses(ecu_address: u8, host_address: u8) -> Self {
        Self {
            ecu_address,
            host_address,
            ..Default::default()
        }
    }

    /// Kawasaki KDS preset (ECU 0x11, tester 0xF2)
    pub fn kawasaki() -> Self {
        Self::default()
    }

    /// Address pair used by the frame codec
    pub fn addressing(&self) -> Addressing {
        Addressing::new(self.ecu_address, self.host_address)
    }

    /// Check invariants the engine relies on
    pub fn validate(&self) -> Result<(), KlineError> {
        if self.ecu_address == self.host_address {
            return Err(KlineError::ConfigError(format!(
                "ECU and host share address {:02X}",
                self.ecu_address
            )));
        }
        if self.timing.byte_poll_ms < MIN_BYTE_POLL_MS {
            return Err(KlineError::ConfigError(format!(
                "byte poll delay {}ms is below the {}ms minimum",
                self.timing.byte_poll_ms, MIN_BYTE_POLL_MS
            )));
        }
        if self.timing.response_timeout_ms <= self.timing.byte_poll_ms {
            return Err(KlineError::ConfigError(format!(
                "response timeout {}ms must exceed byte poll delay {}ms",
                self.timing.response_timeout_ms, self.timing.byte_poll_ms
            )));
        }
        if self.fast_init.baud_rate == 0 {
            return Err(KlineError::ConfigError("baud rate must be non-zero".to_string()));
        }
        if self.pins.rx == self.pins.tx {
            return Err(KlineError::ConfigError(format!(
                "RX and TX share pin {}",
                self.pins.rx
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_kds() {
        let config = KlineConfig::default();
        assert_eq!(config.ecu_address, 0x11);
        assert_eq!(config.host_address, 0xF2);
        assert_eq!(config.timing.byte_poll_ms, 8);
        assert_eq!(config.timing.request_gap_ms, 30);
        assert_eq!(config.timing.response_timeout(), Duration::from_secs(5));
        assert_eq!(config.fast_init.baud_rate, 10400);
        assert!(config.validate().is_ok());
        assert_eq!(KlineConfig::kawasaki(), config);
    }

    #[test]
    fn test_rejects_shared_address() {
        let config = KlineConfig::with_addresses(0x33, 0x33);
        assert!(matches!(config.validate(), Err(KlineError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_fast_poll() {
        let mut config = KlineConfig::default();
        config.timing.byte_poll_ms = 6;
        assert!(config.validate().is_err());

        config.timing.byte_poll_ms = 8;
        config.timing.response_timeout_ms = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_addressing() {
        let config = KlineConfig::with_addresses(0x10, 0xF1);
        assert_eq!(config.addressing(), Addressing::new(0x10, 0xF1));
    }
}
