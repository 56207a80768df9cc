//! TCP server setup and connection handling (plain ws, no TLS)
//!
//! Each accepted client gets a receiver; its measurements are drained and
//! logged until the receiver stops. No payload is sent back.

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::config::ReceiverConfig;
use crate::receiver::{self, StopCause};

/// Pause after a failed accept so a full fd table is not spun on
const ACCEPT_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    config: ReceiverConfig,
    shutdown: CancellationToken,
}

/// What one client session produced
#[derive(Debug)]
pub struct SessionSummary {
    pub measurements: usize,
    /// `None` if the receiver task panicked
    pub cause: Option<StopCause>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        config: ReceiverConfig,
        shutdown: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        tracing::info!(
            %addr,
            max_runtime = ?config.max_runtime,
            max_message_size = config.max_message_size,
            "ndt7 receiver listening"
        );

        Ok(Self {
            listener,
            config,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // EMFILE, ECONNABORTED and the like: keep serving
                        tracing::warn!(error = %e, "failed to accept");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };
            let config = self.config;
            let cancel = self.shutdown.child_token();

            tokio::spawn(async move {
                tracing::debug!(%addr, "connection");
                match accept(stream, &config).await {
                    Ok(ws) => {
                        let summary = drain(ws, cancel, &config).await;
                        tracing::info!(
                            %addr,
                            measurements = summary.measurements,
                            cause = ?summary.cause,
                            "session finished"
                        );
                    }
                    Err(e) => tracing::warn!(%addr, error = %e, "websocket handshake failed"),
                }
            });
        }
    }
}

async fn accept(
    stream: TcpStream,
    config: &ReceiverConfig,
) -> Result<WebSocketStream<TcpStream>, tokio_tungstenite::tungstenite::Error> {
    tokio_tungstenite::accept_async_with_config(stream, Some(config.websocket_config())).await
}

/// Run a receiver over `ws` and consume everything it produces.
pub async fn drain<S>(
    ws: WebSocketStream<S>,
    cancel: CancellationToken,
    config: &ReceiverConfig,
) -> SessionSummary
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // The write half stays open for the duration; only the read half is handed over.
    let (_sink, stream) = ws.split();
    let (mut measurements, task) = receiver::start(cancel, stream, config);

    let mut count = 0;
    while let Some(measurement) = measurements.recv().await {
        count += 1;
        tracing::debug!(?measurement, "measurement");
    }

    let cause = match task.await {
        Ok(cause) => Some(cause),
        Err(e) => {
            tracing::warn!(error = %e, "receiver task failed");
            None
        }
    };

    SessionSummary {
        measurements: count,
        cause,
    }
}
