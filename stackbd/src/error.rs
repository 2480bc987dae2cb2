//! Error types for stackbd.

use std::io;

use thiserror::Error;

// Re-export NbdError from the nbd crate
pub use nbd::NbdError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("chain error: {0}")]
    Chain(#[from] Errno),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(
        "invalid layer name {name:?}: must be non-empty, start alphanumeric, \
         and contain only ASCII alphanumerics or dashes"
    )]
    InvalidLayerName { name: String },

    #[error("layer {name:?} is a {kind} and cannot be placed at position {index} of the chain")]
    MisplacedLayer {
        name: String,
        kind: &'static str,
        index: usize,
    },

    #[error("a chain needs at least an innermost plugin")]
    EmptyChain,
}

/// Data-path errors, drawn from the POSIX errno domain plus the
/// protocol-defined values.
///
/// `NotSup` is special: the dispatcher forbids it from every operation
/// except a zero request carrying the fast-zero flag, where it means
/// "fast zeroing is not possible, retry without the flag".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Errno {
    /// EIO
    #[error("input/output error")]
    Io,

    /// EINVAL
    #[error("invalid argument")]
    Inval,

    /// ENOSPC
    #[error("no space left on device")]
    NoSpace,

    /// EPERM
    #[error("operation not permitted")]
    Perm,

    /// ESHUTDOWN
    #[error("connection is shutting down")]
    Shutdown,

    /// EROFS
    #[error("export is read-only")]
    ReadOnly,

    /// ENOTSUP / EOPNOTSUPP
    #[error("operation not supported")]
    NotSup,

    /// ERANGE
    #[error("value out of range")]
    Range,

    /// ENOMEM
    #[error("out of memory")]
    NoMem,
}

impl Errno {
    /// Map to the NBD wire error code.
    ///
    /// `Range` has no wire equivalent (it never escapes the chain in a
    /// well-behaved server) and degrades to EINVAL; `ReadOnly` maps to
    /// EPERM per the protocol's convention for writes to read-only
    /// exports.
    pub fn to_wire(self) -> u32 {
        match self {
            Errno::Io => nbd::NBD_EIO,
            Errno::Inval | Errno::Range => nbd::NBD_EINVAL,
            Errno::NoSpace => nbd::NBD_ENOSPC,
            Errno::Perm | Errno::ReadOnly => nbd::NBD_EPERM,
            Errno::Shutdown => nbd::NBD_ESHUTDOWN,
            Errno::NotSup => nbd::NBD_ENOTSUP,
            Errno::NoMem => nbd::NBD_ENOMEM,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    #[error("unknown layer: {name}")]
    UnknownLayer { name: String },
}
