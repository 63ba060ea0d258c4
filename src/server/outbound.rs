use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time;

use crate::logger::Logger;

/// Why an outbound writer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// Every sender was dropped; the connection is being torn down normally
    Drained,
    /// A write failed; the session was asked to evict itself
    Failed,
    /// A write did not finish within the write timeout
    TimedOut,
}

/// Spawn the task that owns a connection's write half.
///
/// Messages arrive over a bounded queue so broadcasters never wait on a slow
/// socket. Each write is bounded by `write_timeout`; when one fails or stalls
/// the writer wakes the session through `evict` and stops reading the queue,
/// which turns further sends into `Closed` errors for the broadcaster.
pub fn spawn_writer<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    evict: Arc<Notify>,
    write_timeout: Duration,
    addr: SocketAddr,
    logger: Logger,
) -> JoinHandle<WriterExit>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            match time::timeout(write_timeout, writer.write_all(&buf)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    logger.warn(&format!("❌ Failed to send to client {}: {}", addr, e));
                    evict.notify_one();
                    return WriterExit::Failed;
                }
                Err(_) => {
                    logger.warn(&format!(
                        "⏳ Write to {} stalled for {:?}; evicting",
                        addr, write_timeout
                    ));
                    evict.notify_one();
                    return WriterExit::TimedOut;
                }
            }
        }

        // All senders gone: close our side of the connection.
        let _ = writer.shutdown().await;
        WriterExit::Drained
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9))
    }

    #[tokio::test]
    async fn writes_in_queue_order_and_drains() {
        let (client, mut server) = tokio::io::duplex(256);
        let (tx, rx) = mpsc::channel(8);
        let evict = Arc::new(Notify::new());
        let handle = spawn_writer(client, rx, evict, Duration::from_secs(1), addr(), Logger);

        tx.send(Bytes::from_static(b"one\n")).await.unwrap();
        tx.send(Bytes::from_static(b"two\n")).await.unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap(), WriterExit::Drained);
        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "one\ntwo\n");
    }

    #[tokio::test]
    async fn broken_pipe_requests_eviction() {
        let (client, server) = tokio::io::duplex(16);
        drop(server);
        let (tx, rx) = mpsc::channel(8);
        let evict = Arc::new(Notify::new());
        let handle = spawn_writer(client, rx, evict.clone(), Duration::from_secs(1), addr(), Logger);

        tx.send(Bytes::from_static(b"lost\n")).await.unwrap();

        assert_eq!(handle.await.unwrap(), WriterExit::Failed);
        // The permit is stored, so this resolves immediately.
        time::timeout(Duration::from_secs(1), evict.notified()).await.unwrap();
        assert!(tx.send(Bytes::from_static(b"later\n")).await.is_err());
    }

    #[tokio::test]
    async fn stalled_reader_times_out() {
        // Peer never reads and the pipe holds 4 bytes, so the write blocks.
        let (client, _server) = tokio::io::duplex(4);
        let (tx, rx) = mpsc::channel(8);
        let evict = Arc::new(Notify::new());
        let handle = spawn_writer(client, rx, evict, Duration::from_millis(50), addr(), Logger);

        tx.send(Bytes::from_static(b"far more than four bytes\n")).await.unwrap();

        assert_eq!(handle.await.unwrap(), WriterExit::TimedOut);
    }
}
