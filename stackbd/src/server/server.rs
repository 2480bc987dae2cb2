//! The per-connection NBD server.
//!
//! [`NbdServer::serve`] walks one client through all three protocol
//! phases — handshake, option negotiation, transmission — and funnels
//! every transmission command into the chain dispatcher. It takes any
//! async byte stream, so the same code serves sockets and in-memory test
//! connections.
//!
//! Requests on a connection are dispatched one at a time, which satisfies
//! every thread model a chain can declare; see
//! [`Chain::thread_model`](crate::chain::Chain::thread_model).

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

// Protocol types from the nbd crate
use nbd::*;

use crate::chain::{Chain, Connection, Context};
use crate::config::ExportConfig;
use crate::error::Errno;
use crate::layer::{CacheMode, FuaMode, ZeroMode, FLAG_FAST_ZERO, FLAG_FUA, FLAG_MAY_TRIM};

/// Ceiling on the option data accepted from a client while negotiating;
/// nothing legitimate comes close to it.
const OPTION_DATA_MAX_BYTES: usize = 64 * 1024;

/// Preferred block size for NBD INFO_BLOCK_SIZE advertisement.
const NBD_PREFERRED_BLOCK_SIZE: u32 = 4096;

/// NBD server for handling a single connection against a backend chain.
///
/// The advertised export size and transmission flags are not configuration:
/// they are resolved from the chain's capability answers once the chain is
/// open for the connection.
#[derive(Clone)]
pub struct NbdServer {
    chain: Arc<Chain>,
    export: ExportConfig,
}

/// A negotiated export: the open, prepared chain plus its resolved
/// geometry.
struct OpenedExport {
    conn: Connection,
    ctx: Arc<Context>,
    size: u64,
    flags: u16,
}

impl OpenedExport {
    fn writable(&self) -> bool {
        self.flags & NBD_FLAG_READ_ONLY == 0
    }
}

impl NbdServer {
    /// Create a new NBD server over `chain`.
    pub fn new(chain: Arc<Chain>, export: ExportConfig) -> Self {
        Self { chain, export }
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    /// Walk one client through the whole protocol over `stream`.
    ///
    /// Returns once the client disconnects, negotiation ends without an
    /// export, or the stream fails; the chain is finalised and closed on
    /// every path out.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let no_zeroes = handshake(&mut stream).await?;
        let Some(export) = self.negotiate(&mut stream, no_zeroes).await? else {
            return Ok(());
        };
        let result = self.transmission(&mut stream, &export).await;
        self.shutdown_export(&export).await;
        result
    }

    /// Open and prepare the chain for `requested`, resolving the advertised
    /// size and transmission flags from the chain's capabilities.
    async fn open_export(&self, requested: &str) -> Result<OpenedExport, Errno> {
        let conn = Connection::new(self.chain.clone());
        let _guard = self.chain.lock_callbacks().await;

        let ctx = conn.open_chain(self.export.readonly, requested).await?;
        if let Err(e) = conn.prepare(&ctx).await {
            let _ = conn.finalize(&ctx).await;
            conn.close(&ctx);
            return Err(e);
        }

        let resolved = async {
            let size = conn.get_size(&ctx).await?;
            let flags = transmission_flags(&conn, &ctx).await?;
            Ok::<_, Errno>((size, flags))
        }
        .await;
        match resolved {
            Ok((size, flags)) => {
                drop(_guard);
                Ok(OpenedExport {
                    conn,
                    ctx,
                    size,
                    flags,
                })
            }
            Err(e) => {
                let _ = conn.finalize(&ctx).await;
                conn.close(&ctx);
                Err(e)
            }
        }
    }

    async fn shutdown_export(&self, export: &OpenedExport) {
        let _guard = self.chain.lock_callbacks().await;
        if let Err(e) = export.conn.finalize(&export.ctx).await {
            warn!(error = %e, "finalize failed during connection teardown");
        }
        export.conn.close(&export.ctx);
    }

    /// Whether `requested` names the export this server serves. The empty
    /// name always does: the chain resolves it to its default export.
    fn known_export(&self, requested: &str) -> bool {
        requested.is_empty() || requested == self.export.name
    }

    async fn negotiate<S>(
        &self,
        stream: &mut S,
        no_zeroes: bool,
    ) -> Result<Option<OpenedExport>, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let mut header = [0u8; 16];
            stream.read_exact(&mut header).await?;

            let magic = u64::from_be_bytes(header[0..8].try_into().unwrap());
            if magic != NBD_OPTS_MAGIC {
                return Err(NbdError::BadMagic {
                    context: "option header",
                    value: magic,
                });
            }

            let option = u32::from_be_bytes(header[8..12].try_into().unwrap());
            let length = u32::from_be_bytes(header[12..16].try_into().unwrap()) as usize;

            // A client must not be able to make us buffer arbitrary option
            // data.
            if length > OPTION_DATA_MAX_BYTES {
                return Err(NbdError::Oversized {
                    length: length as u32,
                    limit: OPTION_DATA_MAX_BYTES as u32,
                });
            }

            let mut data = vec![0u8; length];
            stream.read_exact(&mut data).await?;

            debug!(option, length, "client option");

            match option {
                NBD_OPT_EXPORT_NAME => {
                    let requested = String::from_utf8_lossy(&data).into_owned();
                    if !self.known_export(&requested) {
                        // This option has no error reply; drop the client.
                        return Ok(None);
                    }
                    let export = match self.open_export(&requested).await {
                        Ok(export) => export,
                        Err(e) => {
                            warn!(error = %e, "failed to open export");
                            return Ok(None);
                        }
                    };
                    let mut resp = [0u8; 10];
                    resp[0..8].copy_from_slice(&export.size.to_be_bytes());
                    resp[8..10].copy_from_slice(&export.flags.to_be_bytes());
                    stream.write_all(&resp).await?;
                    if !no_zeroes {
                        stream.write_all(&[0u8; 124]).await?;
                    }
                    return Ok(Some(export));
                }
                NBD_OPT_GO | NBD_OPT_INFO => {
                    if data.len() < 4 {
                        option_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                        continue;
                    }
                    let name_len = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
                    if data.len() < 4 + name_len {
                        option_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                        continue;
                    }
                    let requested =
                        String::from_utf8_lossy(&data[4..4 + name_len]).into_owned();
                    if !self.known_export(&requested) {
                        option_reply(stream, option, NBD_REP_ERR_UNKNOWN, &[]).await?;
                        continue;
                    }

                    let export = match self.open_export(&requested).await {
                        Ok(export) => export,
                        Err(e) => {
                            warn!(error = %e, "failed to open export");
                            option_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                            continue;
                        }
                    };

                    // INFO_EXPORT
                    let mut info = [0u8; 12];
                    info[0..2].copy_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
                    info[2..10].copy_from_slice(&export.size.to_be_bytes());
                    info[10..12].copy_from_slice(&export.flags.to_be_bytes());
                    option_reply(stream, option, NBD_REP_INFO, &info).await?;

                    // INFO_BLOCK_SIZE: min, preferred, max payload
                    let mut block = [0u8; 14];
                    block[0..2].copy_from_slice(&NBD_INFO_BLOCK_SIZE.to_be_bytes());
                    block[2..6].copy_from_slice(&NBD_MIN_BLOCK_SIZE.to_be_bytes());
                    block[6..10].copy_from_slice(&NBD_PREFERRED_BLOCK_SIZE.to_be_bytes());
                    block[10..14].copy_from_slice(&NBD_MAX_PAYLOAD_SIZE.to_be_bytes());
                    option_reply(stream, option, NBD_REP_INFO, &block).await?;

                    option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    if option == NBD_OPT_GO {
                        return Ok(Some(export));
                    }
                    // INFO only peeks at the export; tear the chain back down.
                    self.shutdown_export(&export).await;
                }
                NBD_OPT_ABORT => {
                    option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    return Ok(None);
                }
                NBD_OPT_LIST => {
                    let conn = Connection::new(self.chain.clone());
                    let exports = {
                        let _guard = self.chain.lock_callbacks().await;
                        conn.list_exports(self.chain.top_index(), self.export.readonly)
                            .await
                    };
                    match exports {
                        Ok(exports) => {
                            for export in exports {
                                let name = export.name.as_bytes();
                                let description =
                                    export.description.as_deref().unwrap_or("").as_bytes();
                                let mut list =
                                    Vec::with_capacity(4 + name.len() + description.len());
                                list.extend_from_slice(&(name.len() as u32).to_be_bytes());
                                list.extend_from_slice(name);
                                list.extend_from_slice(description);
                                option_reply(stream, option, NBD_REP_SERVER, &list).await?;
                            }
                            option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                        }
                        Err(e) => {
                            warn!(error = %e, "list_exports failed");
                            option_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                        }
                    }
                }
                _ => {
                    option_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?;
                }
            }
        }
    }

    async fn transmission<S>(&self, stream: &mut S, export: &OpenedExport) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut frame = [0u8; Request::WIRE_SIZE];

        loop {
            match stream.read_exact(&mut frame).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            let req = Request::decode(&frame)?;
            if req.check_length(export.size).is_err() {
                send_simple(stream, req.cookie, NBD_EOVERFLOW).await?;
                continue;
            }

            // Every layer callback for this request runs under the shared
            // side of the chain's unload lock.
            let _guard = self.chain.lock_callbacks().await;
            let conn = &export.conn;
            let ctx = &export.ctx;

            match req.command {
                NbdCommand::Read => {
                    let mut data = BytesMut::zeroed(req.length as usize);
                    match conn.pread(ctx, &mut data, req.offset, 0).await {
                        Ok(()) => {
                            stream.write_all(&SimpleReply::ok(req.cookie).encode()).await?;
                            stream.write_all(&data).await?;
                        }
                        Err(e) => {
                            warn!(error = %e, "read error");
                            send_simple(stream, req.cookie, e.to_wire()).await?;
                        }
                    }
                }
                NbdCommand::Write => {
                    let mut data = BytesMut::zeroed(req.length as usize);
                    stream.read_exact(&mut data).await?;

                    if !export.writable() {
                        send_simple(stream, req.cookie, NBD_EPERM).await?;
                        continue;
                    }
                    let result = conn.pwrite(ctx, &data, req.offset, chain_flags(&req)).await;
                    send_simple(stream, req.cookie, status_of("write", result)).await?;
                }
                NbdCommand::Disconnect => return Ok(()),
                NbdCommand::Flush => {
                    let result = conn.flush(ctx, 0).await;
                    send_simple(stream, req.cookie, status_of("flush", result)).await?;
                }
                NbdCommand::Trim => {
                    let result = conn.trim(ctx, req.length, req.offset, chain_flags(&req)).await;
                    send_simple(stream, req.cookie, status_of("trim", result)).await?;
                }
                NbdCommand::Cache => {
                    let result = conn.cache(ctx, req.length, req.offset, 0).await;
                    send_simple(stream, req.cookie, status_of("cache", result)).await?;
                }
                NbdCommand::WriteZeroes => {
                    if !export.writable() {
                        send_simple(stream, req.cookie, NBD_EPERM).await?;
                        continue;
                    }
                    let result = conn.zero(ctx, req.length, req.offset, chain_flags(&req)).await;
                    send_simple(stream, req.cookie, status_of("write_zeroes", result)).await?;
                }
            }
        }
    }
}

/// Resolve the transmission flags to advertise from the chain's
/// capabilities. The dispatcher's coupling rules have already collapsed
/// trim/zero/FUA support on read-only chains.
async fn transmission_flags(conn: &Connection, ctx: &Arc<Context>) -> Result<u16, Errno> {
    let mut flags = NBD_FLAG_HAS_FLAGS;
    if !conn.can_write(ctx).await? {
        flags |= NBD_FLAG_READ_ONLY;
    }
    if conn.can_flush(ctx).await? {
        flags |= NBD_FLAG_SEND_FLUSH;
    }
    if conn.can_fua(ctx).await? > FuaMode::None {
        flags |= NBD_FLAG_SEND_FUA;
    }
    if conn.is_rotational(ctx).await? {
        flags |= NBD_FLAG_ROTATIONAL;
    }
    if conn.can_trim(ctx).await? {
        flags |= NBD_FLAG_SEND_TRIM;
    }
    if conn.can_zero(ctx).await? > ZeroMode::None {
        flags |= NBD_FLAG_SEND_WRITE_ZEROES;
    }
    if conn.can_fast_zero(ctx).await? {
        flags |= NBD_FLAG_SEND_FAST_ZERO;
    }
    if conn.can_multi_conn(ctx).await? {
        flags |= NBD_FLAG_CAN_MULTI_CONN;
    }
    if conn.can_cache(ctx).await? > CacheMode::None {
        flags |= NBD_FLAG_SEND_CACHE;
    }
    Ok(flags)
}

/// Translate a request's wire command flags to the chain's flag values.
fn chain_flags(req: &Request) -> u32 {
    let mut flags = 0;
    if req.flags & NBD_CMD_FLAG_FUA != 0 {
        flags |= FLAG_FUA;
    }
    if req.command == NbdCommand::WriteZeroes {
        if req.flags & NBD_CMD_FLAG_NO_HOLE == 0 {
            flags |= FLAG_MAY_TRIM;
        }
        if req.flags & NBD_CMD_FLAG_FAST_ZERO != 0 {
            flags |= FLAG_FAST_ZERO;
        }
    }
    flags
}

/// Collapse a dispatcher result into the wire status for a simple reply,
/// logging failures.
fn status_of(op: &'static str, result: Result<(), Errno>) -> u32 {
    match result {
        Ok(()) => NBD_OK,
        Err(e) => {
            warn!(error = %e, op, "request failed");
            e.to_wire()
        }
    }
}

async fn send_simple<S>(stream: &mut S, cookie: u64, error: u32) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&SimpleReply::with_error(cookie, error).encode())
        .await?;
    Ok(())
}

async fn handshake<S>(stream: &mut S) -> Result<bool, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_flags = NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES;
    let mut hello = Vec::with_capacity(18);
    hello.extend_from_slice(&NBD_MAGIC.to_be_bytes());
    hello.extend_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
    hello.extend_from_slice(&server_flags.to_be_bytes());
    stream.write_all(&hello).await?;

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    let client_flags = u32::from_be_bytes(buf);

    if (client_flags & NBD_FLAG_C_FIXED_NEWSTYLE) == 0 {
        return Err(NbdError::Handshake("client does not speak fixed newstyle"));
    }

    Ok((client_flags & NBD_FLAG_C_NO_ZEROES) != 0)
}

async fn option_reply<S>(
    stream: &mut S,
    option: u32,
    reply_type: u32,
    data: &[u8],
) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = Vec::with_capacity(20 + data.len());
    reply.extend_from_slice(&NBD_OPTION_REPLY_MAGIC.to_be_bytes());
    reply.extend_from_slice(&option.to_be_bytes());
    reply.extend_from_slice(&reply_type.to_be_bytes());
    reply.extend_from_slice(&(data.len() as u32).to_be_bytes());
    reply.extend_from_slice(data);
    stream.write_all(&reply).await?;
    Ok(())
}
