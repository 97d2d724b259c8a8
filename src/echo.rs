use std::net::{Ipv4Addr, SocketAddr};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
};
use tracing::{info, instrument};

/// Fixed bind address; there is deliberately no runtime configuration.
pub const HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;
pub const PORT: u16 = 30222;

const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum EchoError {
    #[error("failed to bind listening socket")]
    Bind(#[source] std::io::Error),
    #[error("failed to accept connection")]
    Accept(#[source] std::io::Error),
    #[error("connection i/o failed")]
    Io(#[source] std::io::Error),
}

/// A listening endpoint that serves exactly one connection and is then done.
#[derive(Debug)]
pub struct EchoResponder {
    listener: TcpListener,
}

impl EchoResponder {
    /// Binds the fixed loopback endpoint and starts listening.
    pub fn start() -> Result<Self, EchoError> {
        Self::bind(SocketAddr::from((HOST, PORT)))
    }

    /// Creates the socket, enables address reuse so the port can be rebound
    /// right after a previous instance exits, binds and listens with a
    /// backlog of one pending connection.
    pub fn bind(addr: SocketAddr) -> Result<Self, EchoError> {
        let socket = TcpSocket::new_v4().map_err(EchoError::Bind)?;
        socket.set_reuseaddr(true).map_err(EchoError::Bind)?;
        socket.bind(addr).map_err(EchoError::Bind)?;
        let listener = socket.listen(1).map_err(EchoError::Bind)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Blocks until a peer connects, then hands back the connection and its
    /// remote address.
    pub async fn accept_once(&self) -> Result<(TcpStream, SocketAddr), EchoError> {
        let (conn, addr) = self.listener.accept().await.map_err(EchoError::Accept)?;
        info!(%addr, "accepted connection");
        Ok((conn, addr))
    }

    /// Serves the single session to completion. Consuming `self` closes the
    /// listener once the session ends, so a second accept cannot happen.
    pub async fn serve(self) -> Result<(), EchoError> {
        let (mut conn, addr) = self.accept_once().await?;
        echo_loop(&mut conn).await?;
        info!(%addr, "peer closed stream");
        Ok(())
    }
}

/// Writes every chunk read straight back to the peer, unchanged, until a
/// zero-length read signals end-of-stream.
pub async fn echo_loop<S>(conn: &mut S) -> Result<(), EchoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0; CHUNK_SIZE];
    loop {
        let read = conn.read(&mut buf).await.map_err(EchoError::Io)?;
        if read == 0 {
            break;
        }
        conn.write_all(&buf[..read]).await.map_err(EchoError::Io)?;
    }
    Ok(())
}

#[instrument]
pub async fn run() -> Result<(), EchoError> {
    EchoResponder::start()?.serve().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn echoes_bytes_until_peer_closes() {
        let (mut client, mut server) = duplex(64);
        let handle = tokio::spawn(async move { echo_loop(&mut server).await });

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        client.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn large_write_is_rechunked_but_intact() {
        let (mut client, mut server) = duplex(8192);
        let handle = tokio::spawn(async move { echo_loop(&mut server).await });

        let payload: Vec<u8> = (0..2000u32).map(|n| (n % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn empty_stream_terminates_immediately() {
        let (mut client, mut server) = duplex(64);
        client.shutdown().await.unwrap();
        echo_loop(&mut server).await.unwrap();
    }
}
