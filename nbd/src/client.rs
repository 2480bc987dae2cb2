//! A small NBD client.
//!
//! Speaks fixed-newstyle negotiation (via `NBD_OPT_GO`) and the
//! simple-reply transmission phase — enough to drive a server end to end,
//! over TCP or an in-memory stream.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// A negotiated client, ready for transmission commands.
pub struct NbdClient<S> {
    stream: S,
    next_cookie: u64,
    /// Size of the export, as the server advertised it.
    pub size_bytes: u64,
    /// Transmission flags the server advertised for the export.
    pub transmission_flags: u16,
}

impl<S> std::fmt::Debug for NbdClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NbdClient")
            .field("next_cookie", &self.next_cookie)
            .field("size_bytes", &self.size_bytes)
            .field("transmission_flags", &self.transmission_flags)
            .finish()
    }
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Negotiate `export_name` over `stream`.
    pub async fn connect(mut stream: S, export_name: &str) -> Result<Self, NbdError> {
        let no_zeroes = read_hello(&mut stream).await?;

        let mut client_flags = NBD_FLAG_C_FIXED_NEWSTYLE;
        if no_zeroes {
            client_flags |= NBD_FLAG_C_NO_ZEROES;
        }
        stream.write_all(&client_flags.to_be_bytes()).await?;

        send_opt_go(&mut stream, export_name).await?;
        let (size_bytes, transmission_flags) = read_go_replies(&mut stream).await?;

        Ok(Self {
            stream,
            next_cookie: 0,
            size_bytes,
            transmission_flags,
        })
    }

    fn cookie(&mut self) -> u64 {
        let cookie = self.next_cookie;
        self.next_cookie += 1;
        cookie
    }

    /// Send one request header, and its payload for writes. Returns the
    /// cookie the reply must echo.
    async fn submit(
        &mut self,
        command: NbdCommand,
        flags: u16,
        offset: u64,
        length: u32,
        payload: Option<&[u8]>,
    ) -> Result<u64, NbdError> {
        let cookie = self.cookie();
        let req = Request {
            command,
            flags,
            cookie,
            offset,
            length,
        };
        self.stream.write_all(&req.encode()).await?;
        if let Some(data) = payload {
            self.stream.write_all(data).await?;
        }
        Ok(cookie)
    }

    /// Read one simple reply and check that it answers `cookie` with
    /// success.
    async fn complete(&mut self, cookie: u64) -> Result<(), NbdError> {
        let mut buf = [0u8; SimpleReply::WIRE_SIZE];
        self.stream.read_exact(&mut buf).await?;
        let reply = SimpleReply::decode(&buf)?;
        if reply.cookie != cookie {
            return Err(NbdError::CookieMismatch {
                want: cookie,
                got: reply.cookie,
            });
        }
        if reply.error != NBD_OK {
            return Err(NbdError::Remote(reply.error));
        }
        Ok(())
    }

    /// Read `length` bytes at `offset`.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, NbdError> {
        let cookie = self
            .submit(NbdCommand::Read, 0, offset, length, None)
            .await?;
        self.complete(cookie).await?;
        let mut data = BytesMut::zeroed(length as usize);
        self.stream.read_exact(&mut data).await?;
        Ok(data.freeze())
    }

    /// Write `data` at `offset` with the given command flags (e.g.
    /// [`NBD_CMD_FLAG_FUA`]).
    pub async fn write_flags(
        &mut self,
        offset: u64,
        data: &[u8],
        flags: u16,
    ) -> Result<(), NbdError> {
        let cookie = self
            .submit(
                NbdCommand::Write,
                flags,
                offset,
                data.len() as u32,
                Some(data),
            )
            .await?;
        self.complete(cookie).await
    }

    /// Write `data` at `offset`.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdError> {
        self.write_flags(offset, data, 0).await
    }

    /// Commit prior writes to stable storage.
    pub async fn flush(&mut self) -> Result<(), NbdError> {
        let cookie = self.submit(NbdCommand::Flush, 0, 0, 0, None).await?;
        self.complete(cookie).await
    }

    /// Discard a range.
    pub async fn trim(&mut self, offset: u64, length: u32) -> Result<(), NbdError> {
        let cookie = self
            .submit(NbdCommand::Trim, 0, offset, length, None)
            .await?;
        self.complete(cookie).await
    }

    /// Zero a range with the given command flags (e.g.
    /// [`NBD_CMD_FLAG_FAST_ZERO`]).
    pub async fn write_zeroes_flags(
        &mut self,
        offset: u64,
        length: u32,
        flags: u16,
    ) -> Result<(), NbdError> {
        let cookie = self
            .submit(NbdCommand::WriteZeroes, flags, offset, length, None)
            .await?;
        self.complete(cookie).await
    }

    /// Zero a range.
    pub async fn write_zeroes(&mut self, offset: u64, length: u32) -> Result<(), NbdError> {
        self.write_zeroes_flags(offset, length, 0).await
    }

    /// Ask the server to warm a range in whatever caches it keeps.
    pub async fn cache(&mut self, offset: u64, length: u32) -> Result<(), NbdError> {
        let cookie = self
            .submit(NbdCommand::Cache, 0, offset, length, None)
            .await?;
        self.complete(cookie).await
    }

    /// Tell the server we are leaving. No reply is defined.
    pub async fn disconnect(mut self) -> Result<(), NbdError> {
        self.submit(NbdCommand::Disconnect, 0, 0, 0, None).await?;
        Ok(())
    }

    fn has(&self, flag: u16) -> bool {
        self.transmission_flags & flag != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.has(NBD_FLAG_READ_ONLY)
    }

    pub fn supports_flush(&self) -> bool {
        self.has(NBD_FLAG_SEND_FLUSH)
    }

    pub fn supports_fua(&self) -> bool {
        self.has(NBD_FLAG_SEND_FUA)
    }

    pub fn supports_trim(&self) -> bool {
        self.has(NBD_FLAG_SEND_TRIM)
    }

    pub fn supports_write_zeroes(&self) -> bool {
        self.has(NBD_FLAG_SEND_WRITE_ZEROES)
    }

    pub fn supports_fast_zero(&self) -> bool {
        self.has(NBD_FLAG_SEND_FAST_ZERO)
    }

    pub fn supports_cache(&self) -> bool {
        self.has(NBD_FLAG_SEND_CACHE)
    }

    pub fn supports_multi_conn(&self) -> bool {
        self.has(NBD_FLAG_CAN_MULTI_CONN)
    }
}

/// Read the 18-byte server hello. Returns whether the server offered
/// NO_ZEROES.
async fn read_hello<S>(stream: &mut S) -> Result<bool, NbdError>
where
    S: AsyncRead + Unpin,
{
    let mut hello = [0u8; 18];
    stream.read_exact(&mut hello).await?;

    let magic = u64::from_be_bytes(take(&hello, 0));
    if magic != NBD_MAGIC {
        return Err(NbdError::BadMagic {
            context: "server hello",
            value: magic,
        });
    }
    let opts = u64::from_be_bytes(take(&hello, 8));
    if opts != NBD_OPTS_MAGIC {
        return Err(NbdError::BadMagic {
            context: "server hello options",
            value: opts,
        });
    }

    let flags = u16::from_be_bytes(take(&hello, 16));
    if flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
        return Err(NbdError::Handshake("server does not speak fixed newstyle"));
    }
    Ok(flags & NBD_FLAG_NO_ZEROES != 0)
}

/// Send NBD_OPT_GO for `export_name`, requesting no extra info items.
async fn send_opt_go<S>(stream: &mut S, export_name: &str) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let name = export_name.as_bytes();
    let body_len = 4 + name.len() + 2;
    let mut opt = Vec::with_capacity(16 + body_len);
    opt.extend_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
    opt.extend_from_slice(&NBD_OPT_GO.to_be_bytes());
    opt.extend_from_slice(&(body_len as u32).to_be_bytes());
    opt.extend_from_slice(&(name.len() as u32).to_be_bytes());
    opt.extend_from_slice(name);
    opt.extend_from_slice(&0u16.to_be_bytes());
    stream.write_all(&opt).await?;
    Ok(())
}

/// Collect option replies until the final ACK, picking the export size and
/// transmission flags out of the INFO_EXPORT item on the way.
async fn read_go_replies<S>(stream: &mut S) -> Result<(u64, u16), NbdError>
where
    S: AsyncRead + Unpin,
{
    let mut size_bytes = 0u64;
    let mut transmission_flags = 0u16;
    loop {
        let mut header = [0u8; 20];
        stream.read_exact(&mut header).await?;

        let magic = u64::from_be_bytes(take(&header, 0));
        if magic != NBD_OPTION_REPLY_MAGIC {
            return Err(NbdError::BadMagic {
                context: "option reply",
                value: magic,
            });
        }
        let reply = u32::from_be_bytes(take(&header, 12));
        let body_len = u32::from_be_bytes(take(&header, 16)) as usize;

        // Refuse replies larger than we are prepared to buffer.
        if body_len > OPTION_REPLY_MAX_BYTES {
            return Err(NbdError::Oversized {
                length: body_len as u32,
                limit: OPTION_REPLY_MAX_BYTES as u32,
            });
        }
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).await?;

        match reply {
            NBD_REP_ACK => return Ok((size_bytes, transmission_flags)),
            NBD_REP_INFO if body_len >= 12 => {
                if u16::from_be_bytes(take(&body, 0)) == NBD_INFO_EXPORT {
                    size_bytes = u64::from_be_bytes(take(&body, 2));
                    transmission_flags = u16::from_be_bytes(take(&body, 10));
                }
            }
            err if err >= 0x80000000 => {
                return Err(NbdError::Handshake("server refused the export"));
            }
            _ => {}
        }
    }
}
