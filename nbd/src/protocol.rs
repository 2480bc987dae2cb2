//! Wire-level types and constants for the NBD protocol.
//!
//! The numeric values are fixed by the protocol document shipped with the
//! NBD project (`doc/proto.md` in the NetworkBlockDevice repository).
//! Constants this crate never touches itself are still named here: a
//! protocol module that spells out half the wire is harder to check
//! against the document than one that spells out all of it.

#![allow(dead_code)]

use std::io;

use thiserror::Error;

// Handshake magics: "NBDMAGIC", "IHAVEOPT", and the reply magics.
pub const NBD_MAGIC: u64 = 0x4e42444d41474943;
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054;
pub const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003e889045565a9;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

// Flags in the server's hello.
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Flags the client echoes back.
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

// Per-export transmission flags.
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_ROTATIONAL: u16 = 1 << 4;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;
pub const NBD_FLAG_SEND_WRITE_ZEROES: u16 = 1 << 6;
pub const NBD_FLAG_CAN_MULTI_CONN: u16 = 1 << 8;
pub const NBD_FLAG_SEND_CACHE: u16 = 1 << 10;
pub const NBD_FLAG_SEND_FAST_ZERO: u16 = 1 << 11;

// Negotiation options.
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_INFO: u32 = 6;
pub const NBD_OPT_GO: u32 = 7;

// Option reply types; the high bit marks errors.
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_ERR_UNSUP: u32 = 0x80000001;
pub const NBD_REP_ERR_POLICY: u32 = 0x80000002;
pub const NBD_REP_ERR_INVALID: u32 = 0x80000003;
pub const NBD_REP_ERR_UNKNOWN: u32 = 0x80000006;

// Items inside an INFO/GO reply.
pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_NAME: u16 = 1;
pub const NBD_INFO_DESCRIPTION: u16 = 2;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

// Transmission commands.
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISCONNECT: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;
pub const NBD_CMD_CACHE: u16 = 5;
pub const NBD_CMD_WRITE_ZEROES: u16 = 6;

// Per-command flags.
pub const NBD_CMD_FLAG_FUA: u16 = 1 << 0;
pub const NBD_CMD_FLAG_NO_HOLE: u16 = 1 << 1;
pub const NBD_CMD_FLAG_DF: u16 = 1 << 2;
pub const NBD_CMD_FLAG_REQ_ONE: u16 = 1 << 3;
pub const NBD_CMD_FLAG_FAST_ZERO: u16 = 1 << 4;

// Wire error codes (a fixed subset of errno values).
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;
pub const NBD_EOVERFLOW: u32 = 75;
pub const NBD_ENOTSUP: u32 = 95;
pub const NBD_ESHUTDOWN: u32 = 108;

/// Hard ceiling on READ/WRITE payloads (32 MiB). Portable clients assume
/// a server accepts at least this much per request; accepting no more
/// keeps any single request from pinning an unbounded buffer.
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

/// Ceiling on export names and descriptions.
pub const NBD_MAX_STRING: usize = 4096;

/// Ceiling on a single option reply a client will buffer while
/// negotiating.
pub const OPTION_REPLY_MAX_BYTES: usize = 64 * 1024;

/// Smallest block size worth advertising.
pub const NBD_MIN_BLOCK_SIZE: u32 = 1;

/// Copy `N` big-endian bytes out of `buf` starting at `at`.
pub(crate) fn take<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

/// Errors while speaking the protocol.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("bad magic in {context}: {value:#x}")]
    BadMagic { context: &'static str, value: u64 },

    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    #[error("command {0} is not defined by the protocol")]
    UnknownCommand(u16),

    #[error("length {length} exceeds the {limit}-byte limit")]
    Oversized { length: u32, limit: u32 },

    #[error("reply cookie {got:#x} does not answer request cookie {want:#x}")]
    CookieMismatch { want: u64, got: u64 },

    #[error("peer reported wire error {0}")]
    Remote(u32),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A transmission-phase command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
    Cache,
    WriteZeroes,
}

impl NbdCommand {
    pub fn wire_value(self) -> u16 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISCONNECT,
            Self::Flush => NBD_CMD_FLUSH,
            Self::Trim => NBD_CMD_TRIM,
            Self::Cache => NBD_CMD_CACHE,
            Self::WriteZeroes => NBD_CMD_WRITE_ZEROES,
        }
    }
}

impl TryFrom<u16> for NbdCommand {
    type Error = NbdError;

    fn try_from(value: u16) -> Result<Self, NbdError> {
        match value {
            NBD_CMD_READ => Ok(Self::Read),
            NBD_CMD_WRITE => Ok(Self::Write),
            NBD_CMD_DISCONNECT => Ok(Self::Disconnect),
            NBD_CMD_FLUSH => Ok(Self::Flush),
            NBD_CMD_TRIM => Ok(Self::Trim),
            NBD_CMD_CACHE => Ok(Self::Cache),
            NBD_CMD_WRITE_ZEROES => Ok(Self::WriteZeroes),
            other => Err(NbdError::UnknownCommand(other)),
        }
    }
}

/// One transmission request as framed on the wire: magic, flags, command,
/// cookie, offset, length — 28 bytes.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub command: NbdCommand,
    pub flags: u16,
    /// Opaque value the reply must echo.
    pub cookie: u64,
    pub offset: u64,
    pub length: u32,
}

impl Request {
    pub const WIRE_SIZE: usize = 28;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&self.command.wire_value().to_be_bytes());
        buf[8..16].copy_from_slice(&self.cookie.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Frame-level decode: magic and command are checked here, the length
    /// is not. Call [`Request::check_length`] once the export size is at
    /// hand — by then the cookie is known, so an oversized request can
    /// still be answered instead of killing the connection.
    pub fn decode(buf: &[u8; Self::WIRE_SIZE]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes(take(buf, 0));
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::BadMagic {
                context: "request",
                value: magic.into(),
            });
        }
        Ok(Self {
            flags: u16::from_be_bytes(take(buf, 4)),
            command: NbdCommand::try_from(u16::from_be_bytes(take(buf, 6)))?,
            cookie: u64::from_be_bytes(take(buf, 8)),
            offset: u64::from_be_bytes(take(buf, 16)),
            length: u32::from_be_bytes(take(buf, 24)),
        })
    }

    /// Enforce the per-command length ceiling. Payload-carrying commands
    /// are capped at [`NBD_MAX_PAYLOAD_SIZE`]; TRIM, WRITE_ZEROES and
    /// CACHE move no data and may name any range inside the export; FLUSH
    /// and DISCONNECT ignore the field.
    pub fn check_length(&self, export_size: u64) -> Result<(), NbdError> {
        let limit = match self.command {
            NbdCommand::Read | NbdCommand::Write => NBD_MAX_PAYLOAD_SIZE,
            NbdCommand::Trim | NbdCommand::WriteZeroes | NbdCommand::Cache => {
                export_size.min(u32::MAX as u64) as u32
            }
            NbdCommand::Flush | NbdCommand::Disconnect => return Ok(()),
        };
        if self.length > limit {
            return Err(NbdError::Oversized {
                length: self.length,
                limit,
            });
        }
        Ok(())
    }
}

/// A simple (non-structured) reply: error code plus the echoed request
/// cookie — 16 bytes.
#[derive(Debug, Clone, Copy)]
pub struct SimpleReply {
    pub error: u32,
    pub cookie: u64,
}

impl SimpleReply {
    pub const WIRE_SIZE: usize = 16;

    pub fn ok(cookie: u64) -> Self {
        Self {
            error: NBD_OK,
            cookie,
        }
    }

    pub fn with_error(cookie: u64, error: u32) -> Self {
        Self { error, cookie }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.cookie.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::WIRE_SIZE]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes(take(buf, 0));
        if magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(NbdError::BadMagic {
                context: "simple reply",
                value: magic.into(),
            });
        }
        Ok(Self {
            error: u32::from_be_bytes(take(buf, 4)),
            cookie: u64::from_be_bytes(take(buf, 8)),
        })
    }
}
