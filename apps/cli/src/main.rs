use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use co2mon_core::{
    DeviceIdentity, DeviceSession, EndpointErrorPolicy, MonitorEvent, MonitorObserver,
    NusbSession, SessionConfig,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "USB CO2 monitor reader", long_about = None)]
struct Args {
    /// Session configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Vendor ID in hex (default 04D9)
    #[arg(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// Product ID in hex (default A052)
    #[arg(long, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Print every raw frame before decoding
    #[arg(long)]
    raw: bool,

    /// Reconnect up to N times when the device stops responding
    #[arg(long, value_name = "N")]
    reconnect: Option<u32>,

    /// Write the effective configuration to this file and exit
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex ID '{}': {}", s, e))
}

/// Prints readings to stdout, one line per event.
struct PrintObserver;

impl MonitorObserver for PrintObserver {
    fn on_event(&self, event: &MonitorEvent) {
        match event {
            MonitorEvent::Connected { vid, pid } => println!("connected {:04X}:{:04X}", vid, pid),
            MonitorEvent::Disconnected => println!("disconnected"),
            MonitorEvent::Error { kind, message } => error!(kind = %kind, "{}", message),
            MonitorEvent::Co2(m) | MonitorEvent::Temperature(m) | MonitorEvent::Humidity(m) => {
                println!("{}: {}", m.kind, m)
            }
            MonitorEvent::Data(reading) => println!("data: {}", reading),
            MonitorEvent::RawFrame(bytes) => println!("raw: {:02X?}", bytes),
        }
    }
}

fn build_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };

    let defaults = config.identity;
    config.identity = DeviceIdentity {
        vendor_id: args.vid.unwrap_or(defaults.vendor_id),
        product_id: args.pid.unwrap_or(defaults.product_id),
    };
    if args.raw {
        config.emit_raw_frames = true;
    }
    if let Some(max_attempts) = args.reconnect {
        config.endpoint_error_policy = EndpointErrorPolicy::Reconnect { max_attempts };
    }
    Ok(config)
}

fn run_monitor(config: SessionConfig, shutdown: &AtomicBool) -> Result<()> {
    let mut session =
        DeviceSession::with_observer(NusbSession::new(), config, Arc::new(PrintObserver));

    session.connect()?;
    if let Err(e) = session.start_transfer() {
        session.disconnect()?;
        return Err(e.into());
    }
    session.run(shutdown)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = build_config(&args)?;
    if let Some(path) = &args.save_config {
        config.save_to_file(path)?;
        info!(path = %path.display(), "Configuration saved");
        return Ok(());
    }

    info!(device = %config.identity, "Starting co2mon (nusb backend)...");

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            flag.store(true, Ordering::Relaxed);
        }
    });

    let result = tokio::task::spawn_blocking(move || run_monitor(config, &shutdown)).await?;
    if let Err(e) = result {
        error!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_ids() {
        assert_eq!(parse_hex_u16("04D9"), Ok(0x04D9));
        assert_eq!(parse_hex_u16("0xa052"), Ok(0xA052));
        assert!(parse_hex_u16("zz").is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from(["co2mon", "--vid", "1a86", "--raw", "--reconnect", "3"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.identity.vendor_id, 0x1A86);
        assert_eq!(config.identity.product_id, 0xA052);
        assert!(config.emit_raw_frames);
        assert_eq!(
            config.endpoint_error_policy,
            EndpointErrorPolicy::Reconnect { max_attempts: 3 }
        );
    }
}
