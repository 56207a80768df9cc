//! Receiver: consumes the client's counter-flow status reports during a download test
//!
//! While the server pushes payload to the client, the client periodically sends
//! back `Measurement`s as text frames. The receiver owns the read half of the
//! websocket for the whole test, decodes each frame and hands it to a single
//! consumer, one sample at a time.
//!
//! Liveness: the receiver stops on its own after `max_runtime`, whatever the
//! client or the consumer do. Cancellation is only observed between frames.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::tungstenite::{self, Message, protocol::frame::coding::CloseCode};
use tokio_util::sync::CancellationToken;

use ndt7_proto::Measurement;

use crate::config::ReceiverConfig;

/// Why a receiver stopped. Every cause is terminal.
#[derive(Debug, thiserror::Error)]
pub enum StopCause {
    #[error("receiver deadline expired")]
    Deadline,
    #[error("test cancelled")]
    Cancelled,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("consumer dropped the measurement channel")]
    ConsumerGone,
    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),
    #[error("read failed: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("peer closed abnormally (code {code:?})")]
    AbnormalClose { code: Option<u16> },
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: usize, limit: usize },
    #[error("got non-text {0} frame")]
    NonText(&'static str),
    #[error("invalid measurement: {0}")]
    Decode(#[from] serde_json::Error),
}

impl StopCause {
    /// Abnormal causes are reported as warnings, the rest at debug level.
    pub fn is_abnormal(&self) -> bool {
        !matches!(
            self,
            StopCause::Deadline
                | StopCause::Cancelled
                | StopCause::PeerClosed
                | StopCause::ConsumerGone
        )
    }

    fn message(&self) -> &'static str {
        match self {
            StopCause::Deadline | StopCause::Cancelled => "receiver: context done",
            StopCause::PeerClosed | StopCause::ConsumerGone => "receiver: done",
            StopCause::NonText(_) => "receiver: got non-text message",
            StopCause::Decode(_) => "receiver: decoding measurement failed",
            StopCause::ReadTimeout(_)
            | StopCause::Transport(_)
            | StopCause::AbnormalClose { .. }
            | StopCause::Oversized { .. } => "receiver: reading frame failed",
        }
    }

    fn log(&self) {
        if self.is_abnormal() {
            tracing::warn!(cause = %self, "{}", self.message());
        } else {
            tracing::debug!(cause = %self, "{}", self.message());
        }
    }
}

#[derive(Debug)]
enum State {
    Running,
    Stopped(StopCause),
}

/// Roughly 30 years from now, for lifetimes too large to represent.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

struct Receiver<S> {
    conn: S,
    dst: mpsc::Sender<Measurement>,
    cancel: CancellationToken,
    deadline: Instant,
    config: ReceiverConfig,
}

/// Start a receiver on `conn`, the read side of an established websocket.
///
/// Measurements arrive on the returned channel in frame order; the channel
/// closing is the only signal the consumer gets that the receiver stopped.
/// The join handle yields the cause for whoever orchestrates the test.
///
/// The consumer must keep draining the channel for the receiver to observe
/// cancellation promptly.
pub fn start<S>(
    cancel: CancellationToken,
    conn: S,
    config: &ReceiverConfig,
) -> (mpsc::Receiver<Measurement>, JoinHandle<StopCause>)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
    let (dst, measurements) = mpsc::channel(1);
    let receiver = Receiver {
        conn,
        dst,
        cancel,
        deadline: Instant::now()
            .checked_add(config.max_runtime)
            .unwrap_or_else(far_future),
        config: *config,
    };
    (measurements, tokio::spawn(receiver.run()))
}

impl<S> Receiver<S>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    async fn run(mut self) -> StopCause {
        tracing::debug!("receiver: start");
        loop {
            match self.advance().await {
                State::Running => continue,
                State::Stopped(cause) => return self.shutdown(cause),
            }
        }
    }

    fn shutdown(self, cause: StopCause) -> StopCause {
        // The only sender: dropping it ends the sequence.
        drop(self.dst);
        cause.log();
        tracing::debug!("receiver: stop");
        cause
    }

    async fn advance(&mut self) -> State {
        match self.step().await {
            Ok(()) => State::Running,
            Err(cause) => State::Stopped(cause),
        }
    }

    async fn step(&mut self) -> Result<(), StopCause> {
        self.check_liveness()?;
        let Some(frame) = self.read_frame().await? else {
            return Ok(());
        };
        let measurement = Measurement::from_json(frame.to_text()?)?;
        self.deliver(measurement).await
    }

    fn check_liveness(&self) -> Result<(), StopCause> {
        if self.cancel.is_cancelled() {
            return Err(StopCause::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(StopCause::Deadline);
        }
        Ok(())
    }

    /// Read one frame. Returns `None` for control frames, which the transport
    /// answers on its own.
    async fn read_frame(&mut self) -> Result<Option<Message>, StopCause> {
        // Re-armed for every read so a single stalled read cannot outlive
        // the test either.
        let max_runtime = self.config.max_runtime;
        let next = timeout(max_runtime, self.conn.next())
            .await
            .map_err(|_| StopCause::ReadTimeout(max_runtime))?;

        let msg = match next {
            None | Some(Err(tungstenite::Error::ConnectionClosed)) => {
                return Err(StopCause::PeerClosed);
            }
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(msg)) => msg,
        };

        let limit = self.config.max_message_size;
        if msg.len() > limit {
            return Err(StopCause::Oversized {
                size: msg.len(),
                limit,
            });
        }

        match msg {
            Message::Text(text) => Ok(Some(Message::Text(text))),
            Message::Ping(_) | Message::Pong(_) => Ok(None),
            Message::Close(Some(frame)) if frame.code == CloseCode::Normal => {
                Err(StopCause::PeerClosed)
            }
            Message::Close(frame) => Err(StopCause::AbnormalClose {
                code: frame.map(|f| u16::from(f.code)),
            }),
            Message::Binary(_) => Err(StopCause::NonText("binary")),
            Message::Frame(_) => Err(StopCause::NonText("raw")),
        }
    }

    /// Hand the sample over and wait until the consumer has taken it out of
    /// the slot, so at most one decoded sample is ever pending.
    async fn deliver(&mut self, measurement: Measurement) -> Result<(), StopCause> {
        let dst = &self.dst;
        let handoff = async move {
            dst.send(measurement)
                .await
                .map_err(|_| StopCause::ConsumerGone)?;
            dst.reserve()
                .await
                .map(drop)
                .map_err(|_| StopCause::ConsumerGone)
        };
        timeout_at(self.deadline, handoff)
            .await
            .map_err(|_| StopCause::Deadline)?
    }
}
