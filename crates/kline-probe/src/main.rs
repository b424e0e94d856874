//! K-Line Probe - Main Entry Point

use std::path::PathBuf;

use clap::Parser;
use kline_probe::{
    init_logging, parse_register, probe, simulated_line, ProbeError, ProbeSettings,
};
use kline_protocol::{KlineClient, KlineHandle, SerialTransport};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kline-probe", version, about = "Wake a K-line ECU and read registers")]
struct Args {
    /// Registers to read, in hex (e.g. 0x0C 05)
    #[arg(value_parser = parse_register_arg)]
    registers: Vec<u8>,
    /// TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Serial device, overrides the settings file
    #[arg(short, long)]
    port: Option<String>,
    /// List serial ports and exit
    #[arg(long, default_value_t = false)]
    list: bool,
    /// Talk to a simulated ECU instead of the serial port
    #[arg(long, default_value_t = false)]
    simulate: bool,
    /// Log at debug level
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn parse_register_arg(text: &str) -> Result<u8, String> {
    parse_register(text).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    info!("=== K-Line Probe v{} ===", env!("CARGO_PKG_VERSION"));

    if args.list {
        for port in SerialTransport::available_ports().map_err(ProbeError::from)? {
            println!("{}", port);
        }
        return Ok(());
    }

    let mut settings = ProbeSettings::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        settings.port = port;
    }

    let (handle, worker) = if args.simulate {
        info!("Using simulated ECU");
        let line = simulated_line(&settings.link, &args.registers);
        KlineHandle::spawn(KlineClient::new(line, settings.link)?)
    } else {
        let transport =
            SerialTransport::open(&settings.port, settings.link.fast_init.baud_rate)?;
        KlineHandle::spawn(KlineClient::new(transport, settings.link)?)
    };

    let readings = probe(&handle, &args.registers).await?;
    for reading in &readings {
        println!("{}", reading);
    }

    drop(handle);
    worker.join();
    Ok(())
}
