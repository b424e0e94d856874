//! K-Line Probe
//!
//! Wakes an ECU over a K-line adapter and reads a list of registers. Settings come
//! from an optional TOML file overlaid with `KLINE_*` environment variables.

use std::path::Path;

use config::{Config, Environment, File};
use kline_protocol::{
    mock::MockLine, service, KlineConfig, KlineError, KlineHandle, START_COMMUNICATION_OK,
    START_DIAGNOSTIC_SESSION_OK,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Probe errors
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Link error: {0}")]
    Link(#[from] KlineError),

    #[error("Invalid register: {0}")]
    InvalidRegister(String),

    #[error("Logging setup failed: {0}")]
    Logging(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Probe settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Serial device of the K-line adapter
    pub port: String,
    /// Link parameters
    pub link: KlineConfig,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            link: KlineConfig::default(),
        }
    }
}

impl ProbeSettings {
    /// Load settings from `path` (if given) and the environment.
    ///
    /// Nested keys use a double underscore, e.g. `KLINE_LINK__ECU_ADDRESS=16`.
    pub fn load(path: Option<&Path>) -> Result<Self, ProbeError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings: Self = builder
            .add_source(
                Environment::with_prefix("KLINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.link.validate()?;
        Ok(settings)
    }
}

/// Outcome of one register read
#[derive(Debug, Clone)]
pub struct RegisterReading {
    pub register: u8,
    pub result: Result<Vec<u8>, KlineError>,
}

impl std::fmt::Display for RegisterReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}:", self.register)?;
        match &self.result {
            Ok(data) => data.iter().try_for_each(|b| write!(f, " {:02X}", b)),
            Err(e) => write!(f, " error {} ({})", e.code().as_i32(), e),
        }
    }
}

/// Parse a register id given in hex, with or without "0x" ("0x0C", "0C")
pub fn parse_register(text: &str) -> Result<u8, ProbeError> {
    let text = text.trim();
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u8::from_str_radix(hex, 16)
        .map_err(|e| ProbeError::InvalidRegister(format!("{:?}: {}", text, e)))
}

/// Wake the ECU and read each register in order.
///
/// A failed register read does not stop the remaining reads.
pub async fn probe(
    handle: &KlineHandle,
    registers: &[u8],
) -> Result<Vec<RegisterReading>, ProbeError> {
    handle.fast_init().await?;
    info!("Link ready, reading {} registers", registers.len());

    let mut readings = Vec::with_capacity(registers.len());
    for &register in registers {
        let result = handle.read_register(register).await;
        if let Err(e) = &result {
            warn!("Register {:02X} failed: {}", register, e);
        }
        readings.push(RegisterReading { register, result });
    }
    Ok(readings)
}

/// Line with a simulated ECU that accepts fast init and answers every register
/// with its own id
pub fn simulated_line(link: &KlineConfig, registers: &[u8]) -> MockLine {
    let mut line = MockLine::with_addressing(link.addressing());
    line.reply(&START_COMMUNICATION_OK)
        .reply(&START_DIAGNOSTIC_SESSION_OK);
    for &register in registers {
        line.reply(&[
            service::READ_DATA_BY_LOCAL_ID + service::POSITIVE_RESPONSE_OFFSET,
            register,
            register,
        ]);
    }
    line
}

/// Initialize logging
pub fn init_logging(verbose: bool) -> Result<(), ProbeError> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kline_protocol::{ErrorCode, KlineClient, LinkState};
    use std::path::PathBuf;

    fn temp_settings(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("kline-probe-{}-{}.toml", name, std::process::id()))
    }

    #[test]
    fn test_parse_register() {
        assert_eq!(parse_register("0x0C").unwrap(), 0x0C);
        assert_eq!(parse_register("0XfF").unwrap(), 0xFF);
        assert_eq!(parse_register("5b").unwrap(), 0x5B);
        assert_eq!(parse_register(" ad ").unwrap(), 0xAD);
        assert!(parse_register("0x100").is_err());
        assert!(parse_register("zz").is_err());
        assert!(parse_register("").is_err());
    }

    #[test]
    fn test_settings_from_file() {
        let path = temp_settings("good");
        let contents = r#"
port = "/dev/ttyACM1"

[link]
ecu_address = 16

[link.timing]
response_timeout_ms = 2000
"#;
        std::fs::write(&path, contents).unwrap();

        let settings = ProbeSettings::load(Some(path.as_path())).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(settings.port, "/dev/ttyACM1");
        assert_eq!(settings.link.ecu_address, 0x10);
        assert_eq!(settings.link.host_address, 0xF2);
        assert_eq!(settings.link.timing.response_timeout_ms, 2000);
        assert_eq!(settings.link.timing.byte_poll_ms, 8);
    }

    #[test]
    fn test_settings_reject_invalid_link() {
        let path = temp_settings("bad");
        std::fs::write(&path, "[link.timing]\nbyte_poll_ms = 4\n").unwrap();

        let result = ProbeSettings::load(Some(path.as_path()));
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(ProbeError::Link(KlineError::ConfigError(_)))));
    }

    #[test]
    fn test_reading_display() {
        let ok = RegisterReading {
            register: 0x0C,
            result: Ok(vec![0x0B, 0xB8]),
        };
        assert_eq!(ok.to_string(), "0C: 0B B8");

        let failed = RegisterReading {
            register: 0x05,
            result: Err(KlineError::Timeout(5000)),
        };
        assert!(failed.to_string().starts_with("05: error -1"));
    }

    #[tokio::test]
    async fn test_probe_simulated_ecu() {
        let link = KlineConfig::default();
        let registers = [0x0C, 0x05];
        let client = KlineClient::new(simulated_line(&link, &registers), link).unwrap();
        let (handle, _worker) = KlineHandle::spawn(client);

        let readings = probe(&handle, &registers).await.unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].result.as_ref().unwrap(), &vec![0x0C]);
        assert_eq!(readings[1].result.as_ref().unwrap(), &vec![0x05]);
        assert_eq!(handle.link_state().await.unwrap(), LinkState::Ready);
    }

    #[tokio::test]
    async fn test_probe_continues_after_failed_register() {
        let link = KlineConfig::default();
        // Only the first register gets an answer.
        let client = KlineClient::new(simulated_line(&link, &[0x0C]), link).unwrap();
        let (handle, _worker) = KlineHandle::spawn(client);

        let readings = probe(&handle, &[0x0C, 0x0D]).await.unwrap();
        assert!(readings[0].result.is_ok());
        assert_eq!(
            readings[1].result.as_ref().unwrap_err().code(),
            ErrorCode::Timeout
        );
    }
}
