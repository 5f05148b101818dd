//! Raw connection capability and the default TCP transport

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Bidirectional byte-stream connection.
///
/// All operations take `&self` so a connection can be read, written and
/// closed concurrently from different tasks. `close` must unblock any
/// in-flight `read`/`write`.
#[async_trait]
pub trait RawConnection: Send + Sync + 'static {
    /// Read into `buf`, returning the number of bytes read (0 on EOF)
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning the number of bytes accepted
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close the connection
    async fn close(&self) -> io::Result<()>;

    /// Remote endpoint, for diagnostics
    fn remote_addr(&self) -> String;

    /// Local endpoint, if the transport has one
    fn local_addr(&self) -> Option<String> {
        None
    }
}

/// TCP connection split into independently locked halves
#[derive(Debug)]
pub struct TcpConnection {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    remote_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr().ok();
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            remote_addr,
            local_addr,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "tcp connection shut down")
    }
}

#[async_trait]
impl RawConnection for TcpConnection {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(Self::closed_error()),
            guard = self.reader.lock() => guard,
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Self::closed_error()),
            result = reader.read(buf) => result,
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(Self::closed_error()),
            guard = self.writer.lock() => guard,
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Self::closed_error()),
            result = writer.write(buf) => result,
        }
    }

    async fn close(&self) -> io::Result<()> {
        // Wakes pending reads/writes so they release their half
        self.shutdown.cancel();

        trace!("Shutting down TCP connection to {}", self.remote_addr);
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            // Peer already went away
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.to_string()
    }

    fn local_addr(&self) -> Option<String> {
        self.local_addr.map(|addr| addr.to_string())
    }
}
