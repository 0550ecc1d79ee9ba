//! Message channels between the primary and its workers.
//!
//! A [`Channel`] is the sending half of one primary↔worker link. Messages are
//! queued in order and written as JSON lines by a dedicated writer task, so a
//! channel is FIFO. Inbound lines are parsed by a reader task that hands each
//! message to a sink, one at a time, in receipt order.

use super::protocol::Message;
use crate::error::{ClusterError, Result};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Sending half of a message channel.
#[derive(Debug, Clone)]
pub struct Channel {
    label: Arc<str>,
    tx: mpsc::UnboundedSender<Message>,
}

impl Channel {
    /// Create a channel plus the receiver that drains it.
    ///
    /// The receiver is usually handed to [`spawn_writer`]; in-process tests
    /// read from it directly.
    pub fn pair(label: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let label: String = label.into();
        (
            Self {
                label: label.into(),
                tx,
            },
            rx,
        )
    }

    /// Human-readable name of the peer, used in logs and errors.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue a message for the peer.
    ///
    /// Fails with [`ClusterError::ChannelClosed`] once the peer's pipe is gone.
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| ClusterError::ChannelClosed(self.label.to_string()))
    }

    /// Like [`send`](Self::send), but a closed pipe is logged and ignored when
    /// `shutting_down` is set. Every other failure is still returned.
    pub fn send_lenient(&self, message: Message, shutting_down: bool) -> Result<()> {
        let kind = message.kind();
        match self.send(message) {
            Err(e) if shutting_down && e.is_closed_pipe() => {
                tracing::debug!(
                    peer = %self.label,
                    kind,
                    operation = "SHUTDOWN",
                    index_prefix = "SYSTEM",
                    "Ignoring send on closed pipe during shutdown"
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Whether the peer has stopped draining this channel.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Write queued messages to `writer` as JSON lines until the queue closes or a
/// write fails. A failed write drops the queue, which closes every [`Channel`]
/// feeding it.
pub fn spawn_writer<W>(writer: W, mut rx: mpsc::UnboundedReceiver<Message>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut writer = BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, writer);
        while let Some(message) = rx.recv().await {
            let line = match message.to_line() {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(kind = message.kind(), error = %e, "Dropping unserializable message");
                    continue;
                }
            };
            if let Err(e) = write_line(&mut writer, &line).await {
                if e.kind() == io::ErrorKind::BrokenPipe {
                    tracing::debug!("IPC pipe closed by peer");
                } else {
                    tracing::warn!(error = %e, "IPC write failed");
                }
                break;
            }
        }
    })
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut BufWriter<W>, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Read JSON lines from `reader`, handing each parsed message to `sink`.
///
/// Stops at EOF, on a read error, or when `sink` returns `false`. Lines that
/// do not parse are logged and skipped.
pub fn spawn_reader<R, F>(reader: R, mut sink: F) -> JoinHandle<io::Result<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(Message) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::with_capacity(DEFAULT_BUFFER_SIZE, reader);
        let mut line = String::with_capacity(4096);
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            if line.trim().is_empty() {
                continue;
            }
            match Message::from_line(&line) {
                Ok(message) => {
                    if !sink(message) {
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed IPC line");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_fifo_over_pipe() {
        let (client, server) = tokio::io::duplex(1024);
        let (channel, rx) = Channel::pair("worker 1");
        let writer = spawn_writer(client, rx);

        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let reader = spawn_reader(server, move |msg| sink_tx.send(msg).is_ok());

        channel.send(Message::BootComplete).unwrap();
        channel
            .send(Message::response("a", 7, json!({ "n": 1 })))
            .unwrap();
        channel.send(Message::Shutdown).unwrap();
        drop(channel);

        assert_eq!(sink_rx.recv().await, Some(Message::BootComplete));
        assert_eq!(
            sink_rx.recv().await,
            Some(Message::response("a", 7, json!({ "n": 1 })))
        );
        assert_eq!(sink_rx.recv().await, Some(Message::Shutdown));

        writer.await.unwrap();
        reader.await.unwrap().unwrap();
        assert_eq!(sink_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_reader_skips_malformed_lines() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let reader = spawn_reader(server, move |msg| sink_tx.send(msg).is_ok());

        client
            .write_all(b"garbage\n\n{\"type\":\"shutdown\"}\r\n")
            .await
            .unwrap();
        drop(client);

        assert_eq!(sink_rx.recv().await, Some(Message::Shutdown));
        reader.await.unwrap().unwrap();
        assert_eq!(sink_rx.recv().await, None);
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (channel, rx) = Channel::pair("worker 2");
        drop(rx);
        assert!(channel.is_closed());

        let err = channel.send(Message::Shutdown).unwrap_err();
        assert!(err.is_closed_pipe());
        assert!(err.to_string().contains("worker 2"));
    }

    #[test]
    fn test_send_lenient_swallows_only_during_shutdown() {
        let (channel, rx) = Channel::pair("worker 3");
        drop(rx);

        assert!(channel.send_lenient(Message::Shutdown, true).is_ok());
        assert!(channel.send_lenient(Message::Shutdown, false).is_err());
    }
}
