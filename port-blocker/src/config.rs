use std::path::PathBuf;

use clap::ValueEnum;
use port_blocker_common::{DEFAULT_OBJECT_FILE, DEFAULT_PIN_PATH, UNSET_PORT};

use crate::error::{Error, Result};

/// The only interface the filter is attached to.
pub const DEFAULT_INTERFACE: &str = "lo";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum XdpMode {
    /// Let the kernel pick (native if the driver supports it)
    #[default]
    Auto,
    Skb,
    Driver,
    Hw,
}

/// How to resolve an image that carries more than one XDP program.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum SelectionPolicy {
    /// Take the last XDP program in name order
    #[default]
    LastSeenWins,
    /// Refuse to pick
    Reject,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub object_path: PathBuf,
    pub pin_path: PathBuf,
    pub interface: String,
    /// Explicit program name; overrides the kind scan when set.
    pub program: Option<String>,
    pub xdp_mode: XdpMode,
    pub selection: SelectionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            object_path: PathBuf::from(DEFAULT_OBJECT_FILE),
            pin_path: PathBuf::from(DEFAULT_PIN_PATH),
            interface: DEFAULT_INTERFACE.to_string(),
            program: None,
            xdp_mode: XdpMode::default(),
            selection: SelectionPolicy::default(),
        }
    }
}

/// Parse a decimal port in `1..=65535`.
pub fn parse_port(input: &str) -> Result<u16> {
    let port: u16 = input.parse().map_err(|_| Error::Argument {
        input: input.to_string(),
        reason: "not a decimal number in 1-65535",
    })?;
    if port == UNSET_PORT {
        return Err(Error::Argument {
            input: input.to_string(),
            reason: "port 0 is not a valid port",
        });
    }
    Ok(port)
}
