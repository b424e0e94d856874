//! Serial Port Line Driver
//!
//! Drives a K-line through a USB serial interface (FTDI-style "KKL" cable). There is no
//! separate GPIO on such adapters, so the wake-up pulse is produced with the UART break
//! condition: asserting break pulls TX low, clearing it releases the line high.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use tokio_serial::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info};

use crate::error::KlineError;
use crate::transport::{Gpio, PinLevel, PinMode, Transport};

/// Read timeout of the underlying port; reads only happen once data is buffered
const READ_TIMEOUT_MS: u64 = 100;

/// K-line over a host serial port
pub struct SerialTransport {
    /// Serial port handle
    port: Box<dyn SerialPort>,
    /// Device path (e.g., "/dev/ttyUSB0" or "COM3")
    device: String,
    /// Zero point of the millisecond clock
    epoch: Instant,
}

impl SerialTransport {
    /// Open `device` at `baud_rate`, 8N1 without flow control
    pub fn open(device: &str, baud_rate: u32) -> Result<Self, KlineError> {
        info!("Opening K-line adapter {} at {} baud", device, baud_rate);
        let port = tokio_serial::new(device, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(READ_TIMEOUT_MS))
            .open()
            .map_err(|e| KlineError::SerialError(format!("{}: {}", device, e)))?;

        Ok(Self {
            port,
            device: device.to_string(),
            epoch: Instant::now(),
        })
    }

    /// Names of the serial ports present on this machine
    pub fn available_ports() -> Result<Vec<String>, KlineError> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| KlineError::SerialError(e.to_string()))?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    /// Device path this transport was opened on
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Transport for SerialTransport {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), KlineError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, KlineError> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| KlineError::SerialError(e.to_string()))
    }

    fn read_byte(&mut self) -> Result<u8, KlineError> {
        let mut byte = [0u8; 1];
        self.port.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn sleep_millis(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn release(&mut self) -> Result<(), KlineError> {
        self.port
            .clear(ClearBuffer::All)
            .map_err(|e| KlineError::SerialError(e.to_string()))
    }

    fn reconfigure(&mut self, baud_rate: u32) -> Result<(), KlineError> {
        debug!("Reconfiguring {} to {} baud", self.device, baud_rate);
        self.port
            .set_baud_rate(baud_rate)
            .and_then(|_| self.port.clear(ClearBuffer::Input))
            .map_err(|e| KlineError::SerialError(e.to_string()))
    }
}

impl Gpio for SerialTransport {
    fn set_pin_mode(&mut self, pin: u8, mode: PinMode) -> Result<(), KlineError> {
        // Direction is fixed by the adapter.
        debug!("Pin {} mode {:?} (no-op on serial adapter)", pin, mode);
        Ok(())
    }

    fn set_pin_level(&mut self, _pin: u8, level: PinLevel) -> Result<(), KlineError> {
        let result = match level {
            PinLevel::Low => self.port.set_break(),
            PinLevel::High => self.port.clear_break(),
        };
        result.map_err(|e| KlineError::SerialError(e.to_string()))
    }
}
