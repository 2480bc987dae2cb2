//! NBD (Network Block Device) server over a backend chain.
//!
//! [`NbdServer`] speaks the protocol for one connection, dispatching every
//! transmission command through the chain dispatcher. [`Accept`] is the
//! source the daemon drains for new connections: real sockets in
//! production, a [`ConnQueue`] of in-memory streams in tests.

mod server;

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

pub use nbd::{NbdCommand, Request, SimpleReply};
pub use server::NbdServer;

/// Where a daemon's client connections come from.
///
/// The daemon drains an acceptor until it reports exhaustion. Socket
/// listeners never do; a [`ConnQueue`] ends once its sending half is
/// dropped, which is how tests wind the daemon down.
#[async_trait]
pub trait Accept: Send {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// The next client connection, or `None` once no more will arrive.
    async fn next_conn(&mut self) -> io::Result<Option<Self::Conn>>;
}

#[async_trait]
impl Accept for TcpListener {
    type Conn = TcpStream;

    async fn next_conn(&mut self) -> io::Result<Option<TcpStream>> {
        let (stream, peer) = TcpListener::accept(self).await?;
        debug!(%peer, "client connected");
        Ok(Some(stream))
    }
}

#[cfg(unix)]
#[async_trait]
impl Accept for UnixListener {
    type Conn = UnixStream;

    async fn next_conn(&mut self) -> io::Result<Option<UnixStream>> {
        let (stream, _) = UnixListener::accept(self).await?;
        debug!("client connected on unix socket");
        Ok(Some(stream))
    }
}

/// In-memory connection source fed through a channel.
///
/// Tests pair it with `tokio::io::duplex`: push the server half of each
/// duplex stream through the sender, hand the queue to the daemon, and
/// drop the sender when done.
pub struct ConnQueue<S> {
    pending: mpsc::Receiver<S>,
}

impl<S> ConnQueue<S> {
    /// A queue holding at most `depth` pending connections, plus the
    /// sending half used to push them.
    pub fn new(depth: usize) -> (mpsc::Sender<S>, Self) {
        let (tx, pending) = mpsc::channel(depth);
        (tx, Self { pending })
    }
}

#[async_trait]
impl<S> Accept for ConnQueue<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Conn = S;

    async fn next_conn(&mut self) -> io::Result<Option<S>> {
        Ok(self.pending.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn conn_queue_drains_in_order_then_ends() {
        let (tx, mut queue) = ConnQueue::new(4);

        let (_a, server_a) = duplex(64);
        let (_b, server_b) = duplex(64);
        tx.send(server_a).await.unwrap();
        tx.send(server_b).await.unwrap();

        assert!(queue.next_conn().await.unwrap().is_some());
        assert!(queue.next_conn().await.unwrap().is_some());

        drop(tx);
        assert!(queue.next_conn().await.unwrap().is_none());
    }
}
