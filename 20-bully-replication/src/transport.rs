//! Point-to-point stream transport.
//!
//! Every exchange opens a fresh TCP connection, writes one message, optionally
//! reads one reply, and closes. The whole exchange is bounded by a single
//! timeout so no caller can stall on an unresponsive peer.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::message::{Message, read_message, write_message};

#[derive(Debug, Clone, Copy)]
pub struct Transport {
    timeout: Duration,
}

impl Transport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Delivers a message without waiting for a reply.
    pub async fn send(&self, addr: SocketAddr, message: &Message) -> Result<()> {
        timeout(self.timeout, async {
            let mut stream = TcpStream::connect(addr).await?;
            write_message(&mut stream, message).await?;
            stream.shutdown().await?;
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|_| anyhow!("timed out sending {} to {addr}", message.kind()))?
        .with_context(|| format!("failed to send {} to {addr}", message.kind()))
    }

    /// Sends a message and waits for exactly one reply on the same connection.
    ///
    /// Returns `None` when the peer closes the connection without replying.
    pub async fn request(&self, addr: SocketAddr, message: &Message) -> Result<Option<Message>> {
        timeout(self.timeout, async {
            let stream = TcpStream::connect(addr).await?;
            let (reader, mut writer) = stream.into_split();
            write_message(&mut writer, message).await?;
            let mut reader = BufReader::new(reader);
            read_message::<_, Message>(&mut reader).await
        })
        .await
        .map_err(|_| anyhow!("timed out waiting for {addr} to answer {}", message.kind()))?
        .with_context(|| format!("{} request to {addr} failed", message.kind()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn request_reads_single_reply() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let request = read_message::<_, Message>(&mut reader)
                .await
                .expect("read")
                .expect("message");
            write_message(&mut writer, &Message::ElectionAck { ok: true })
                .await
                .expect("reply");
            request
        });

        let transport = Transport::new(Duration::from_secs(1));
        let reply = transport.request(addr, &Message::Election { from: 1 }).await?;
        assert_eq!(reply, Some(Message::ElectionAck { ok: true }));
        assert_eq!(server.await?, Message::Election { from: 1 });
        Ok(())
    }

    #[tokio::test]
    async fn silent_peer_times_out() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        // Accept and hold the connection open without answering.
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let transport = Transport::new(Duration::from_millis(200));
        let result = transport.request(addr, &Message::Election { from: 1 }).await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_peer_is_an_error() -> Result<()> {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?
        };
        let transport = Transport::new(Duration::from_millis(500));
        assert!(transport.send(addr, &Message::Heartbeat { from: 1 }).await.is_err());
        Ok(())
    }
}
