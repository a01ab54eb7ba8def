use std::env::VarError;

use http::Uri;

use crate::error::RelayError;

/// Environment-sourced configuration, per spec section 6. Every key is required;
/// `Config::from_env` fails closed with a `RelayError::Config` naming the missing key
/// rather than panicking, so a misconfigured deployment gets one diagnostic line
/// instead of a backtrace.
#[derive(Debug, Clone)]
pub struct Config {
    pub rbmc_host: String,
    pub rbmc_port: u16,
    pub rbmc_user: String,
    pub rbmc_pass: String,
    pub ibge_endpoint_url: String,
    pub local_ntrip_port: u16,
    pub serial_port: String,
    pub orch_host: String,
    pub orch_port: u16,
}

fn env_var(key: &str) -> Result<String, RelayError> {
    std::env::var(key).map_err(|e| match e {
        VarError::NotPresent => RelayError::Config(format!("missing environment variable {key}")),
        VarError::NotUnicode(_) => {
            RelayError::Config(format!("environment variable {key} is not valid UTF-8"))
        }
    })
}

fn env_port(key: &str) -> Result<u16, RelayError> {
    let raw = env_var(key)?;
    raw.parse()
        .map_err(|_| RelayError::Config(format!("{key} is not a valid port: {raw:?}")))
}

/// `RBMC_CASTER` may be a bare hostname or a URL; if it parses as a URL with a scheme
/// and host, the host (and port, if present) are pulled out of it, mirroring the
/// `urlparse` branch in the original prototype.
fn split_caster_host(raw: &str, fallback_port: Result<u16, RelayError>) -> Result<(String, u16), RelayError> {
    if let Ok(uri) = raw.parse::<Uri>() {
        if let Some(host) = uri.host() {
            if uri.scheme().is_some() {
                let port = uri.port_u16().map(Ok).unwrap_or(fallback_port)?;
                return Ok((host.to_string(), port));
            }
        }
    }
    Ok((raw.to_string(), fallback_port?))
}

impl Config {
    pub fn from_env() -> Result<Self, RelayError> {
        let raw_caster = env_var("RBMC_CASTER")?;
        let (rbmc_host, rbmc_port) = split_caster_host(&raw_caster, env_port("RBMC_PORT"))?;

        Ok(Config {
            rbmc_host,
            rbmc_port,
            rbmc_user: env_var("RBMC_USER")?,
            rbmc_pass: env_var("RBMC_PASS")?,
            ibge_endpoint_url: env_var("IBGE_ENDPOINT_URL")?,
            local_ntrip_port: env_port("LOCAL_NTRIP_PORT")?,
            serial_port: env_var("SERIAL_PORT")?,
            orch_host: env_var("ORCH_HOST")?,
            orch_port: env_port("ORCH_PORT")?,
        })
    }
}
