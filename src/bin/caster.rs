use anyhow::{Context as ErrorContext, Result};
use clap::{arg, value_parser, Command};

use rbmc_relay::caster::Caster;
use rbmc_relay::config::Config;

async fn run() -> Result<()> {
    let matches = Command::new("caster")
        .version("0.1")
        .arg(
            arg!(
                -p --port <PORT> "Overrides LOCAL_NTRIP_PORT for the rover-facing listener"
            )
            .required(false)
            .value_parser(value_parser!(u16)),
        )
        .arg(
            arg!(
                --"upstream-host" <HOST> "Overrides the upstream caster host parsed from RBMC_CASTER"
            )
            .required(false),
        )
        .arg(
            arg!(
                --"upstream-port" <PORT> "Overrides RBMC_PORT"
            )
            .required(false)
            .value_parser(value_parser!(u16)),
        )
        .get_matches();

    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(port) = matches.get_one::<u16>("port") {
        config.local_ntrip_port = *port;
    }
    if let Some(host) = matches.get_one::<String>("upstream-host") {
        config.rbmc_host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("upstream-port") {
        config.rbmc_port = *port;
    }

    let caster = Caster::new(config);
    caster.serve_forever().await.context("caster exited")?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run())
}
