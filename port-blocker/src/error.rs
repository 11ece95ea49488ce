//! Error types for port-blocker

use std::{error::Error as _, fmt, io, path::PathBuf};

use aya::{EbpfError, maps::MapError, pin::PinError, programs::ProgramError};
use aya_obj::ParseError;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What a [`Error::ResourceNotFound`] was looking for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    Table,
    Program,
    Interface,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceKind::Table => "table",
            ResourceKind::Program => "program",
            ResourceKind::Interface => "interface",
        };
        f.write_str(label)
    }
}

/// Main error type for port-blocker operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Port argument out of range or not a number
    #[error("invalid port {input:?}: {reason}")]
    Argument { input: String, reason: &'static str },

    /// RLIMIT_MEMLOCK could not be raised
    #[error("failed to remove the locked-memory limit")]
    Privilege(#[source] io::Error),

    #[error("failed to read program image {}", path.display())]
    ImageNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("program image {} is malformed", path.display())]
    MalformedImage {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    /// The kernel refused a table or program of the image
    #[error("failed to realize {object}")]
    Realize {
        object: String,
        #[source]
        source: EbpfError,
    },

    #[error("{kind} {name} not found")]
    ResourceNotFound { kind: ResourceKind, name: String },

    /// The control table exists but is not a `u32 -> u16` array or hash map
    #[error("table {table} must be an array or hash map")]
    TableType { table: String },

    /// Selection found programs but none it may use
    #[error("cannot select filtering program: {0}")]
    Selection(String),

    #[error("failed to attach {program} to {iface}")]
    Attach {
        program: String,
        iface: String,
        #[source]
        source: ProgramError,
    },

    #[error("failed to detach {program}")]
    Detach {
        program: String,
        #[source]
        source: ProgramError,
    },

    #[error("failed to write port {port} to {table}")]
    Write {
        table: String,
        port: u16,
        #[source]
        source: MapError,
    },

    #[error("failed to read {table}")]
    Read {
        table: String,
        #[source]
        source: MapError,
    },

    #[error("failed to open pinned table at {}", path.display())]
    OpenPinned {
        path: PathBuf,
        #[source]
        source: MapError,
    },

    /// Only ever surfaced as a warning by the orchestrator
    #[error("failed to pin {table} at {}", path.display())]
    Pin {
        table: String,
        path: PathBuf,
        #[source]
        source: PinError,
    },

    #[error("failed to wait for shutdown signal")]
    Signal(#[source] io::Error),
}

impl Error {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            kind,
            name: name.into(),
        }
    }

    /// The message followed by every source, `: `-separated, for log lines.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            out.push_str(": ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }

    /// Operator-facing advice for the failures that have a usual cause.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::Argument { .. } => Some("the port must be a decimal number between 1 and 65535"),
            Error::Privilege(_) => Some("run as root, or grant CAP_BPF, CAP_NET_ADMIN and CAP_SYS_RESOURCE"),
            Error::ImageNotFound { .. } => Some(
                "run from the directory holding the compiled image, or pass --object; \
                 alternatively load the program once with `hold` so the table gets pinned",
            ),
            Error::MalformedImage { .. } => Some("the image must be a BPF ELF object (clang -target bpf)"),
            Error::Realize { .. } => Some("loading BPF objects needs root or CAP_BPF; check dmesg for verifier output"),
            Error::ResourceNotFound {
                kind: ResourceKind::Table | ResourceKind::Program,
                ..
            }
            | Error::TableType { .. }
            | Error::Selection(_) => Some("rebuild the image so it defines blocked_port_map and one XDP program"),
            Error::ResourceNotFound {
                kind: ResourceKind::Interface,
                ..
            } => Some("the target interface does not exist on this host"),
            Error::Attach { .. } => Some("another XDP program may already be attached; try --xdp-mode skb"),
            _ => None,
        }
    }
}
