//! Streaming pump shared by the watch handlers of every transport.
//!
//! The pump drains one [`Subscription`] into an [`UpdateSink`], coalescing
//! writes behind a short debounce timer and keeping idle streams alive
//! with heartbeat events.
//!
//! ```text
//!   select! ─┬─ event dequeued   → encode, re-arm flush timer
//!            ├─ flush timer      → flush everything since last flush
//!            ├─ heartbeat timer  → health event + flush
//!            ├─ control message  → health event + flush, reset heartbeat
//!            ├─ peer gone        → ClientDisconnected
//!            └─ shutdown         → Shutdown
//! ```

use super::{Subscription, SubscriptionState};
use crate::model::ChangeEvent;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

/// Debounce between the last dequeue and the flush.
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(10);

/// Idle period after which a heartbeat is sent.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Unflushed events that force a flush without waiting for the timer.
pub const DEFAULT_MAX_BATCH: usize = 64;

/// Failures that end a stream abnormally.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("receiver not keeping up with updates")]
    Backpressure,

    #[error("error sending update: {0}")]
    Encode(String),

    #[error("error flushing update(s): {0}")]
    Flush(String),

    #[error("error reading control message: {0}")]
    Decode(String),
}

/// Why a stream ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    ClientDisconnected,
    MaxUpdates(u64),
    Shutdown,
}

/// Signal from the inbound half of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The client sent a request on the open stream.
    Request,
    /// Clean end of the inbound half.
    Disconnected,
    /// Inbound data could not be decoded.
    Failed(String),
}

/// Error returned by a sink whose peer has gone away.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("peer disconnected")]
    Disconnected,
    #[error("{0}")]
    Failed(String),
}

/// Outbound half of a watch stream.
#[async_trait]
pub trait UpdateSink: Send {
    /// Encode one event. May buffer until [`UpdateSink::flush`].
    async fn send(&mut self, event: &ChangeEvent) -> Result<(), SinkError>;

    /// Push buffered events to the peer.
    async fn flush(&mut self) -> Result<(), SinkError>;

    /// Resolves once the peer can no longer receive. Sinks without a way to
    /// observe that rely on send errors instead.
    async fn closed(&mut self) {
        std::future::pending::<()>().await
    }
}

/// Pump tuning.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub flush_delay: Duration,
    pub heartbeat_interval: Duration,
    pub max_batch: usize,
    /// Events to deliver before ending; zero streams until the peer leaves.
    pub max_updates: u64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            flush_delay: DEFAULT_FLUSH_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_batch: DEFAULT_MAX_BATCH,
            max_updates: 0,
        }
    }
}

impl StreamOptions {
    pub fn with_max_updates(mut self, max_updates: u64) -> Self {
        self.max_updates = max_updates;
        self
    }
}

async fn next_control(control: &mut Option<mpsc::Receiver<ControlEvent>>) -> Option<ControlEvent> {
    match control {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct Pump<'a, S: UpdateSink + ?Sized> {
    sink: &'a mut S,
    unflushed: usize,
}

impl<S: UpdateSink + ?Sized> Pump<'_, S> {
    async fn send(&mut self, event: &ChangeEvent) -> Result<(), Outcome> {
        self.sink.send(event).await.map_err(|e| match e {
            SinkError::Disconnected => Outcome::Clean(StreamEnd::ClientDisconnected),
            SinkError::Failed(msg) => Outcome::Failed(StreamError::Encode(msg)),
        })
    }

    async fn flush(&mut self) -> Result<(), Outcome> {
        if self.unflushed > 1 {
            tracing::debug!(events = self.unflushed, "flushing events");
        }
        self.unflushed = 0;
        self.sink.flush().await.map_err(|e| match e {
            SinkError::Disconnected => Outcome::Clean(StreamEnd::ClientDisconnected),
            SinkError::Failed(msg) => Outcome::Failed(StreamError::Flush(msg)),
        })
    }
}

enum Outcome {
    Clean(StreamEnd),
    Failed(StreamError),
}

/// Drain `subscription` into `sink` until a terminal condition.
///
/// The subscription is consumed and deregistered on every exit path.
pub async fn stream_updates<S, H>(
    mut subscription: Subscription,
    sink: &mut S,
    mut control: Option<mpsc::Receiver<ControlEvent>>,
    mut shutdown: watch::Receiver<bool>,
    options: &StreamOptions,
    health: H,
) -> Result<StreamEnd, StreamError>
where
    S: UpdateSink + ?Sized,
    H: Fn() -> String + Send,
{
    subscription.mark_streaming();
    let mut pump = Pump { sink, unflushed: 0 };

    let flush_timer = sleep(options.flush_delay);
    tokio::pin!(flush_timer);
    let mut flush_armed = false;
    let heartbeat = sleep(options.heartbeat_interval);
    tokio::pin!(heartbeat);
    let mut shutdown_open = true;
    let mut delivered = 0u64;

    let outcome: Outcome = loop {
        if *shutdown.borrow() {
            break Outcome::Clean(StreamEnd::Shutdown);
        }
        if options.max_updates > 0 && delivered >= options.max_updates {
            if pump.unflushed > 0 {
                if let Err(outcome) = pump.flush().await {
                    break outcome;
                }
            }
            break Outcome::Clean(StreamEnd::MaxUpdates(delivered));
        }

        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    if subscription.state() == SubscriptionState::ClosedBackpressure {
                        break Outcome::Failed(StreamError::Backpressure);
                    }
                    break Outcome::Clean(StreamEnd::Shutdown);
                };
                if let Err(outcome) = pump.send(&event).await {
                    break outcome;
                }
                delivered += 1;
                pump.unflushed += 1;
                if pump.unflushed >= options.max_batch.max(1) {
                    if let Err(outcome) = pump.flush().await {
                        break outcome;
                    }
                    flush_armed = false;
                    heartbeat.as_mut().reset(Instant::now() + options.heartbeat_interval);
                } else {
                    flush_timer.as_mut().reset(Instant::now() + options.flush_delay);
                    flush_armed = true;
                }
            }
            _ = &mut flush_timer, if flush_armed => {
                flush_armed = false;
                if let Err(outcome) = pump.flush().await {
                    break outcome;
                }
                heartbeat.as_mut().reset(Instant::now() + options.heartbeat_interval);
            }
            _ = &mut heartbeat => {
                tracing::debug!(subscription = %subscription.id(), "sending heartbeat");
                if let Err(outcome) = pump.send(&ChangeEvent::health(health())).await {
                    break outcome;
                }
                if let Err(outcome) = pump.flush().await {
                    break outcome;
                }
                flush_armed = false;
                heartbeat.as_mut().reset(Instant::now() + options.heartbeat_interval);
            }
            message = next_control(&mut control) => match message {
                Some(ControlEvent::Request) => {
                    heartbeat.as_mut().reset(Instant::now() + options.heartbeat_interval);
                    if let Err(outcome) = pump.send(&ChangeEvent::health(health())).await {
                        break outcome;
                    }
                    if let Err(outcome) = pump.flush().await {
                        break outcome;
                    }
                    flush_armed = false;
                }
                Some(ControlEvent::Failed(reason)) => {
                    break Outcome::Failed(StreamError::Decode(reason));
                }
                Some(ControlEvent::Disconnected) | None => {
                    break Outcome::Clean(StreamEnd::ClientDisconnected);
                }
            },
            _ = pump.sink.closed() => {
                break Outcome::Clean(StreamEnd::ClientDisconnected);
            }
            changed = shutdown.changed(), if shutdown_open => {
                if changed.is_err() {
                    shutdown_open = false;
                }
            }
        }
    };

    let result = match outcome {
        Outcome::Clean(end) => {
            subscription.finish(SubscriptionState::ClosedClean);
            tracing::debug!(subscription = %subscription.id(), ?end, delivered, "update stream ended");
            Ok(end)
        }
        Outcome::Failed(error) => {
            subscription.finish(SubscriptionState::ClosedError);
            tracing::warn!(subscription = %subscription.id(), error = %error, delivered, "update stream failed");
            Err(error)
        }
    };
    drop(subscription);
    result
}
