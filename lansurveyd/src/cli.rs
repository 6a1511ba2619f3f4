use std::path::PathBuf;
use anyhow::{anyhow, Result};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Args {
    pub config: Option<PathBuf>,
    /// Log file, appended to
    pub output: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Run(Args),
    Help,
    Version,
}

pub fn version_text() -> String {
    format!("lansurveyd {}", env!("CARGO_PKG_VERSION"))
}

pub fn usage_text() -> String {
    format!(
        "{}
LAN host and service discovery (mDNS/DNS-SD, UPnP, ARP)

Usage:
  lansurveyd [-c <PATH>] [-o <PATH>]

Options:
  -c, --config <PATH>  TOML configuration file
  -o, --output <PATH>  Append log output to this file
  -h, --help           Show this help text
  -V, --version        Show version",
        version_text()
    )
}

pub fn parse<I>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-V" | "--version" => return Ok(Command::Version),
            "-c" | "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("Missing value for {}", arg))?;
                parsed.config = Some(PathBuf::from(value));
            }
            "-o" | "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("Missing value for {}", arg))?;
                parsed.output = Some(PathBuf::from(value));
            }
            other => return Err(anyhow!("Unknown argument: {}", other)),
        }
    }

    Ok(Command::Run(parsed))
}
