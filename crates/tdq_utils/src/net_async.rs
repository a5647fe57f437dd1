//! Async TCP server/client plumbing shared by the queue and workers.
//! Must be used from within a Tokio runtime.

use std::{io, net::SocketAddr, time::Duration};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::timeout_future::TimeoutFuture;

pub type ServerStream = TcpStream;
pub type ClientStream = TcpStream;

#[derive(Debug)]
pub struct ServerListener {
    listener: TcpListener,
}

impl ServerListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn accept(&self) -> io::Result<(ServerStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }
}

/// Connects to `addr`, failing with [io::ErrorKind::TimedOut] if no connection is made in time.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<ClientStream> {
    match TimeoutFuture::new(TcpStream::connect(addr), timeout)
        .wait()
        .await
    {
        Some(stream) => {
            let stream = stream?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        None => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("timed out connecting to {addr}"),
        )),
    }
}
