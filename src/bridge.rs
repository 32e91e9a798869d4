//! Bridge from a demultiplexed log stream to a server-sent event stream
//!
//! Each log-viewing client gets its own bridge: one task owning the leftover
//! buffer, the keep-alive timer and the upstream handle. The task ends on the
//! first of upstream error, upstream end or cancellation, and only the first
//! two emit a terminal event.

use crate::demux::DemuxStream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use http_body_util::{combinators::BoxBody, BodyExt, StreamBody};
use hyper::body::Frame as BodyFrame;
use parking_lot::Mutex;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Default interval between keep-alive comments
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);

/// Events buffered between the bridge task and the consumer
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub keepalive_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE,
        }
    }
}

/// One outbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A decoded log payload
    Text(String),
    /// Upstream failed; terminal
    Error(String),
    /// Upstream ended; terminal
    End,
    /// No-op comment to keep intermediaries from timing out the connection
    KeepAlive,
}

impl BridgeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BridgeEvent::Error(_) | BridgeEvent::End)
    }

    /// Encode as one `text/event-stream` record
    pub fn to_sse(&self) -> Bytes {
        let record = match self {
            BridgeEvent::Text(text) => {
                format!("data: {}\n\n", serde_json::json!({ "text": text }))
            }
            BridgeEvent::Error(message) => {
                format!(
                    "event: error\ndata: {}\n\n",
                    serde_json::json!({ "error": message })
                )
            }
            BridgeEvent::End => {
                format!(
                    "event: end\ndata: {}\n\n",
                    serde_json::json!({ "text": "[log stream ended]" })
                )
            }
            BridgeEvent::KeepAlive => ": keep-alive\n\n".to_string(),
        };
        Bytes::from(record)
    }
}

/// A running bridge for one consumer
///
/// Dropping the bridge has the same effect as [`LogBridge::cancel`].
pub struct LogBridge {
    events: mpsc::Receiver<BridgeEvent>,
    cancel_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    upstream: Releasable,
    cancelled: bool,
}

impl LogBridge {
    /// Start consuming `upstream` and producing events.
    pub fn open<S, B, E>(upstream: S, config: BridgeConfig) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let slot = Arc::new(Mutex::new(Some(upstream)));
        let shared = SharedUpstream {
            slot: Arc::clone(&slot),
        };
        let upstream = Releasable(Arc::new(move || {
            let released = slot.lock().take();
            drop(released);
        }));
        let release_on_exit = upstream.clone();

        let payloads = DemuxStream::new(shared).map(|item| item.map_err(|e| e.to_string()));
        let task = tokio::spawn(async move {
            run_bridge(payloads, config.keepalive_interval, tx, cancel_rx).await;
            release_on_exit.release();
        });

        Self {
            events,
            cancel_tx,
            task: Some(task),
            upstream,
            cancelled: false,
        }
    }

    /// Next event, or `None` once the bridge has closed or been cancelled
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.next().await
    }

    /// Stop the bridge. Safe to call any number of times, in any state.
    ///
    /// The upstream handle is released before this returns; the task and
    /// its keep-alive timer are aborted.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.cancel_tx.send_replace(true);
        self.events.close();
        self.upstream.release();
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Wait until the bridge task has exited and released its upstream.
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Turn the bridge into a streaming HTTP response body.
    pub fn into_body(self) -> BoxBody<Bytes, hyper::Error> {
        let frames = self.map(|event| Ok::<_, hyper::Error>(BodyFrame::data(event.to_sse())));
        BodyExt::boxed(StreamBody::new(frames))
    }
}

impl Stream for LogBridge {
    type Item = BridgeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancelled {
            return Poll::Ready(None);
        }
        this.events.poll_recv(cx)
    }
}

impl Drop for LogBridge {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Upstream slot shared by the bridge task and [`LogBridge::cancel`]
struct SharedUpstream<S> {
    slot: Arc<Mutex<Option<S>>>,
}

impl<S> Stream for SharedUpstream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.slot.lock().as_mut() {
            Some(upstream) => Pin::new(upstream).poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

/// Drops the upstream held in a [`SharedUpstream`] slot; idempotent
#[derive(Clone)]
struct Releasable(Arc<dyn Fn() + Send + Sync>);

impl Releasable {
    fn release(&self) {
        (self.0)()
    }
}

async fn run_bridge<S>(
    mut payloads: S,
    period: Duration,
    tx: mpsc::Sender<BridgeEvent>,
    mut cancel_rx: watch::Receiver<bool>,
) where
    S: Stream<Item = Result<String, String>> + Unpin,
{
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.changed() => {
                debug!("Log bridge cancelled");
                break;
            }
            _ = tx.closed() => {
                debug!("Log consumer disconnected");
                break;
            }
            item = payloads.next() => {
                let event = match item {
                    Some(Ok(text)) => BridgeEvent::Text(text),
                    Some(Err(message)) => {
                        debug!(error = %message, "Log upstream failed");
                        BridgeEvent::Error(message)
                    }
                    None => {
                        debug!("Log upstream ended");
                        BridgeEvent::End
                    }
                };
                let terminal = event.is_terminal();
                if tx.send(event).await.is_err() || terminal {
                    break;
                }
            }
            _ = keepalive.tick() => {
                if tx.send(BridgeEvent::KeepAlive).await.is_err() {
                    break;
                }
            }
        }
    }
}
