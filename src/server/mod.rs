// === IMPORTS ===

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time;

// === MODULES ===

pub mod fanout;
pub mod frame;
pub mod outbound;
pub mod ratelimiter;
pub mod registry;
pub mod session;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::logger::Logger;
use crate::server::fanout::Broadcaster;
use crate::server::frame::FrameReader;
use crate::server::outbound::spawn_writer;
use crate::server::registry::{ConnId, PeerHandle, Registry};
use crate::server::session::{Session, SessionContext};
use crate::sink::SinkHandle;

// === RELAY ===

/// A bound listener plus the shared state every session needs.
///
/// The registry is created here and handed by reference to each session;
/// there is no process-wide client list.
pub struct Relay {
    listener: TcpListener,
    config: Arc<RelayConfig>,
    ctx: Arc<SessionContext>,
    logger: Logger,
}

impl Relay {
    /// Validate the config and bind the listening socket. A bind failure is
    /// the one error that should stop the process at startup.
    pub async fn bind(config: RelayConfig, sink: SinkHandle, logger: Logger) -> Result<Self> {
        config.validate()?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        logger.info(&format!("🚀 Relay listening on {}", listener.local_addr()?));

        let registry = Registry::new();
        let ctx = Arc::new(SessionContext {
            registry: registry.clone(),
            broadcaster: Broadcaster::new(registry, config.overflow_policy, logger.clone()),
            sink,
            framing: config.framing,
            client_timeout: config.client_timeout(),
            rate_limit: config.rate_limit_msgs_per_minute,
            logger: logger.clone(),
        });

        Ok(Self {
            listener,
            config: Arc::new(config),
            ctx,
            logger,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the live membership (shares state with the running relay).
    pub fn registry(&self) -> Registry {
        self.ctx.registry.clone()
    }

    /// Accept connections until `shutdown` resolves. On shutdown every session
    /// is told to stop; the call returns without waiting for them.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        tokio::pin!(shutdown);
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            next_id += 1;
                            self.handle_new_connection(stream, addr, ConnId::new(next_id), &shutdown_tx)
                                .await;
                        }
                        // e.g. too many open files: warn and pause briefly
                        Err(e) => {
                            self.logger.warn(&format!("⚠️ Failed to accept connection: {}", e));
                            time::sleep(self.config.accept_error_backoff()).await;
                        }
                    }
                }
                _ = &mut shutdown => {
                    self.logger.info("🧹 Relay received shutdown signal.");
                    let _ = shutdown_tx.send(());
                    break;
                }
            }
        }

        Ok(())
    }

    /// Wire up one accepted stream: outbound writer, registry entry, session task.
    async fn handle_new_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        id: ConnId,
        shutdown_tx: &broadcast::Sender<()>,
    ) {
        // Small messages should leave immediately
        if let Err(e) = stream.set_nodelay(true) {
            self.logger
                .warn(&format!("⚠️  Failed to set TCP_NODELAY for {}: {}", addr, e));
        }

        let (reader_half, writer_half) = stream.into_split();

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue_capacity);
        let evict = Arc::new(Notify::new());
        let writer = spawn_writer(
            writer_half,
            outbound_rx,
            evict.clone(),
            self.config.write_timeout(),
            addr,
            self.logger.clone(),
        );

        let peer = PeerHandle {
            id,
            addr,
            outbound: outbound_tx,
            evict,
        };

        match self.ctx.registry.register(peer.clone()).await {
            Ok(active) => {
                self.logger.info(&format!(
                    "🔌 {} connected as {}. Active connections: {}",
                    addr, id, active
                ));
            }
            Err(e) => {
                self.logger.error(&format!("Refusing {}: {}", addr, e));
                writer.abort();
                return;
            }
        }

        let frames = FrameReader::new(reader_half, self.config.framing, self.config.max_frame_bytes);
        let session = Session::new(peer, frames, writer, self.ctx.clone(), shutdown_tx.subscribe());
        tokio::spawn(session.run());
    }
}

/// Bind and serve until Ctrl+C.
pub async fn run_server(config: RelayConfig, sink: SinkHandle, logger: Logger) -> Result<()> {
    let relay = Relay::bind(config, sink, logger.clone()).await?;
    relay.run_until(shutdown_signal(logger)).await
}

/// Resolves on Ctrl+C. If the signal handler can't be installed the relay
/// keeps running; it can still be killed.
async fn shutdown_signal(logger: Logger) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        logger.error(&format!("Failed to listen for ctrl_c: {}", e));
        std::future::pending::<()>().await;
    }
    logger.warn("🛑 Ctrl+C received, shutting down.");
}
