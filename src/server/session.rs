use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::Framing;
use crate::error::FrameError;
use crate::logger::Logger;
use crate::server::fanout::Broadcaster;
use crate::server::frame::FrameReader;
use crate::server::outbound::WriterExit;
use crate::server::ratelimiter::RateLimiter;
use crate::server::registry::{PeerHandle, Registry};
use crate::sink::SinkHandle;

pub const SHUTDOWN_NOTICE: &[u8] = b"Warning: Server is shutting down.\n";
pub const IDLE_NOTICE: &[u8] = b"Warning: You have been disconnected due to inactivity.\n";
pub const RATE_LIMIT_NOTICE: &[u8] =
    b"Warning: You are sending messages too quickly. Please slow down.\n";

/// Everything sessions share. Built once by the accept loop.
pub struct SessionContext {
    pub registry: Registry,
    pub broadcaster: Broadcaster,
    pub sink: SinkHandle,
    pub framing: Framing,
    pub client_timeout: Option<Duration>,
    pub rate_limit: Option<u32>,
    pub logger: Logger,
}

/// Why a session ended. Every variant goes through the same cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer closed its side (zero-byte read)
    Closed,
    /// Reset, broken pipe or any other read failure
    TransportError,
    /// Bytes that are not valid UTF-8
    DecodeError,
    /// Nothing received within the idle timeout
    TimedOut,
    /// The broadcaster or the outbound writer gave up on this client
    Evicted,
    /// The relay is stopping
    Shutdown,
}

/// One client connection, end to end.
pub struct Session<R> {
    peer: PeerHandle,
    frames: FrameReader<R>,
    writer: JoinHandle<WriterExit>,
    ctx: Arc<SessionContext>,
    shutdown_rx: broadcast::Receiver<()>,
    rate_limiter: Option<RateLimiter>,
}

impl<R: AsyncRead + Unpin> Session<R> {
    /// `peer` must already be registered; the session owns its removal.
    pub fn new(
        peer: PeerHandle,
        frames: FrameReader<R>,
        writer: JoinHandle<WriterExit>,
        ctx: Arc<SessionContext>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let rate_limiter = ctx.rate_limit.map(RateLimiter::new);
        Self {
            peer,
            frames,
            writer,
            ctx,
            shutdown_rx,
            rate_limiter,
        }
    }

    /// Serve the client until a terminal event, then unregister and release
    /// the connection. This is the only place a session leaves the registry.
    pub async fn run(mut self) -> SessionEnd {
        let end = self.serve().await;
        let logger = &self.ctx.logger;

        match self.ctx.registry.unregister(self.peer.id).await {
            Some(remaining) => logger.info(&format!(
                "🧼 Client {} ({}) removed; {} clients remain",
                self.peer.id, self.peer.addr, remaining
            )),
            None => logger.debug(&format!("Client {} was already unregistered", self.peer.id)),
        }

        // An evicted client may have a writer stuck on a dead socket; don't
        // wait for it. Otherwise the writer flushes any notice and closes.
        if end == SessionEnd::Evicted {
            self.writer.abort();
        }

        logger.info(&format!("{} connection closed ({:?}).", self.peer.addr, end));
        end
    }

    async fn serve(&mut self) -> SessionEnd {
        let logger = self.ctx.logger.clone();
        let addr = self.peer.addr;

        loop {
            let next = tokio::select! {
                next = next_frame(&mut self.frames, self.ctx.client_timeout) => next,
                _ = self.peer.evict.notified() => {
                    logger.warn(&format!("🚨 {} evicted.", addr));
                    return SessionEnd::Evicted;
                }
                _ = self.shutdown_rx.recv() => {
                    logger.warn(&format!("🛑 {} disconnected due to shutdown.", addr));
                    self.notify(SHUTDOWN_NOTICE);
                    return SessionEnd::Shutdown;
                }
            };

            match next {
                Some(Ok(Some(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.handle_message(text).await;
                }
                Some(Ok(None)) => {
                    logger.info(&format!("⚠️ {} disconnected gracefully.", addr));
                    return SessionEnd::Closed;
                }
                Some(Err(FrameError::Transport(e))) => {
                    logger.warn(&format!("❌ Error reading from {}: {}", addr, e));
                    return SessionEnd::TransportError;
                }
                Some(Err(FrameError::Decode(e))) => {
                    logger.warn(&format!("❌ Undecodable bytes from {}: {}", addr, e));
                    return SessionEnd::DecodeError;
                }
                None => {
                    logger.info(&format!(
                        "⏰ Client {} timed out after {:?} of inactivity",
                        addr, self.ctx.client_timeout
                    ));
                    self.notify(IDLE_NOTICE);
                    return SessionEnd::TimedOut;
                }
            }
        }
    }

    /// Log the message, then fan it out. The sink and the broadcast are
    /// independent: a sink failure is reported and delivery goes ahead.
    async fn handle_message(&mut self, text: String) {
        if let Some(limiter) = self.rate_limiter.as_mut() {
            if !limiter.check_limit() {
                self.ctx.logger.warn(&format!("🐢 Rate limit hit by {}; message dropped", self.peer.addr));
                self.notify(RATE_LIMIT_NOTICE);
                return;
            }
        }

        self.ctx
            .logger
            .info(&format!("📨 From {}: {}", self.peer.addr, text));

        let text_len = text.len();
        let payload = match self.ctx.framing {
            Framing::Lines => Bytes::from(text + "\n"),
            Framing::Raw => Bytes::from(text),
        };

        // Same allocation for both: the log entry is the message without the newline.
        if let Err(e) = self.ctx.sink.submit(payload.slice(..text_len)) {
            self.ctx
                .logger
                .warn(&format!("📝 Message from {} not logged: {}", self.peer.addr, e));
        }

        let report = self.ctx.broadcaster.broadcast(self.peer.id, payload).await;
        self.ctx.logger.debug(&format!(
            "Relayed message from {} to {} of {} recipients",
            self.peer.id,
            report.delivered,
            report.recipients()
        ));
    }

    /// Best-effort notice to this client through its own outbound queue.
    fn notify(&self, notice: &'static [u8]) {
        let _ = self.peer.outbound.try_send(Bytes::from_static(notice));
    }
}

/// `None` when the idle timeout elapsed before a frame arrived.
async fn next_frame<R: AsyncRead + Unpin>(
    frames: &mut FrameReader<R>,
    idle: Option<Duration>,
) -> Option<Result<Option<String>, FrameError>> {
    match idle {
        Some(limit) => time::timeout(limit, frames.read_frame()).await.ok(),
        None => Some(frames.read_frame().await),
    }
}
