//! # TCP Connection Abstraction
//!
//! Wraps TCP streams with message framing for the P2C2R protocol.
//!
//! ## Wire Protocol
//!
//! Messages are sent with a 4-byte length prefix (big-endian) followed by JSON
//! data:
//! ```text
//! [4 bytes: message length] [N bytes: JSON envelope]
//! ```
//!
//! The length prefix gives reliable message boundaries over the byte stream
//! and lets us reject oversized frames before allocating.
//!
//! The coordinator reads and writes each connection from separate tasks, so
//! [`Connection::into_split`] hands out independently owned halves. All writes
//! to one connection go through a single writer task, which keeps at most one
//! frame in flight per connection.

use anyhow::Result;
use log::error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::messages::Envelope;

/// Maximum allowed message size (100MB) to prevent memory exhaustion.
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// TCP connection wrapper with message framing support.
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Create a new Connection from an established TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Split into independently owned read/write halves so a reader task and
    /// a writer task can run concurrently on the same connection.
    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        let (read, write) = self.stream.into_split();
        (ConnectionReader { read }, ConnectionWriter { write })
    }

    /// Read one framed message from the connection.
    ///
    /// # Returns
    /// - `Ok(Some(Envelope))`: successfully read and deserialized a message
    /// - `Ok(None)`: connection closed, or the frame was oversized/garbled
    /// - `Err`: I/O error mid-frame
    pub async fn read_message(&mut self) -> Result<Option<Envelope>> {
        read_frame(&mut self.stream).await
    }

    /// Write one framed message to the connection.
    pub async fn write_message(&mut self, envelope: &Envelope) -> Result<()> {
        write_frame(&mut self.stream, envelope).await
    }
}

/// Owned read half of a connection.
pub struct ConnectionReader {
    read: OwnedReadHalf,
}

impl ConnectionReader {
    /// Read one framed message; `Ok(None)` means the connection closed.
    pub async fn read_message(&mut self) -> Result<Option<Envelope>> {
        read_frame(&mut self.read).await
    }
}

/// Owned write half of a connection.
pub struct ConnectionWriter {
    write: OwnedWriteHalf,
}

impl ConnectionWriter {
    /// Write one framed message and flush it.
    pub async fn write_message(&mut self, envelope: &Envelope) -> Result<()> {
        write_frame(&mut self.write, envelope).await
    }
}

async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>>
where
    R: AsyncReadExt + Unpin,
{
    // 4-byte length prefix first
    let mut length_buf = [0u8; 4];
    if reader.read_exact(&mut length_buf).await.is_err() {
        // Connection closed cleanly (or mid-prefix, treated the same)
        return Ok(None);
    }

    let length = u32::from_be_bytes(length_buf) as usize;
    if length > MAX_MESSAGE_SIZE {
        error!(
            "❌ Message too large: {} bytes (max: {} bytes)",
            length, MAX_MESSAGE_SIZE
        );
        return Ok(None);
    }

    let mut data = vec![0u8; length];
    reader.read_exact(&mut data).await?;

    match Envelope::from_bytes(&data) {
        Ok(env) => Ok(Some(env)),
        Err(e) => {
            error!("❌ Failed to deserialize message: {}", e);
            Ok(None)
        }
    }
}

async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let data = envelope.to_bytes()?;
    let length = data.len() as u32;

    // Send: [4 bytes length][message data]
    writer.write_all(&length.to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::messages::Message;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn framed_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(socket);
            conn.read_message().await.unwrap()
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Connection::new(stream);
        conn.write_message(&Envelope::new(Message::GamerRegister {
            client_id: "gamer_1".into(),
        }))
        .await
        .unwrap();

        let received = server.await.unwrap().expect("expected a message");
        match received.msg {
            Message::GamerRegister { client_id } => assert_eq!(client_id, "gamer_1"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn split_halves_carry_messages_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = Connection::new(socket).into_split();
            let first = reader.read_message().await.unwrap().unwrap();
            writer.write_message(&first).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = Connection::new(stream).into_split();
        writer
            .write_message(&Envelope::new(Message::TaskTimeout {
                task_id: "t9".into(),
                error: "timeout".into(),
            }))
            .await
            .unwrap();

        let echoed = reader.read_message().await.unwrap().unwrap();
        match echoed.msg {
            Message::TaskTimeout { task_id, .. } => assert_eq!(task_id, "t9"),
            other => panic!("unexpected message: {:?}", other),
        }
        server.await.unwrap();
    }
}
