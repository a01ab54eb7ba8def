use anyhow::{Context as ErrorContext, Result};
use clap::{arg, value_parser, Command};

use rbmc_relay::config::Config;
use rbmc_relay::gateway::Gateway;

async fn run() -> Result<()> {
    let matches = Command::new("gateway")
        .version("0.1")
        .arg(
            arg!(
                -s --"serial-port" <PATH> "Overrides SERIAL_PORT, e.g. /dev/ttyUSB0"
            )
            .required(false),
        )
        .arg(
            arg!(
                -b --baud <BAUD> "Overrides the serial baud rate (default 115200)"
            )
            .required(false)
            .value_parser(value_parser!(u32)),
        )
        .arg(
            arg!(
                --"orch-host" <HOST> "Overrides ORCH_HOST, the caster's address"
            )
            .required(false),
        )
        .arg(
            arg!(
                --"orch-port" <PORT> "Overrides ORCH_PORT"
            )
            .required(false)
            .value_parser(value_parser!(u16)),
        )
        .get_matches();

    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(serial_port) = matches.get_one::<String>("serial-port") {
        config.serial_port = serial_port.clone();
    }
    if let Some(host) = matches.get_one::<String>("orch-host") {
        config.orch_host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("orch-port") {
        config.orch_port = *port;
    }

    let mut gateway = Gateway::new(config);
    if let Some(baud) = matches.get_one::<u32>("baud") {
        gateway = gateway.with_baud(*baud);
    }

    gateway.run().await.context("gateway exited")?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run())
}
