//! Dedicated writer task for WebSocket connections.
//!
//! Each connection owns exactly one writer task that holds the WebSocket
//! sink. Everything else (request senders, response tasks, broadcast
//! fan-out) hands frames to it through an mpsc channel, so no lock is ever
//! held around the socket.
//!
//! # Architecture
//!
//! ```text
//! request()   ─┐
//! responses   ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► WebSocket sink
//! broadcasts  ─┘
//! ```
//!
//! Ready frames are batched: the task `feed`s everything already queued and
//! flushes once. A pending-frame counter provides backpressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Sink, SinkExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::config::duration_ms;
use crate::error::{ButlerError, Result};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// One JSON text message.
    Text(String),
    /// Close the connection with a status code and reason.
    Close {
        /// WebSocket close code (1000 = normal).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

impl OutboundFrame {
    fn into_message(self) -> Message {
        match self {
            OutboundFrame::Text(text) => Message::Text(text),
            OutboundFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    #[serde(with = "duration_ms", rename = "backpressure_timeout_ms")]
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    /// Channel sender for frames.
    tx: mpsc::Sender<OutboundFrame>,
    /// Pending frame count (for backpressure).
    pending: Arc<AtomicUsize>,
    /// Maximum pending frames.
    max_pending: usize,
    /// Backpressure timeout.
    timeout: Duration,
}

impl WriterHandle {
    /// Send a frame to the writer task.
    ///
    /// Waits while backpressure is active, timing out after the configured
    /// duration.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            ButlerError::ConnectionClosed
        })
    }

    /// Send one text message.
    pub async fn send_text(&self, text: String) -> Result<()> {
        self.send(OutboundFrame::Text(text)).await
    }

    /// Ask the writer task to send a close frame and stop.
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> Result<()> {
        self.send(OutboundFrame::Close {
            code,
            reason: reason.into(),
        })
        .await
    }

    /// Wait for backpressure to clear with timeout.
    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_millis(1);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(ButlerError::ConnectionClosed);
            }
            if start.elapsed() > self.timeout {
                return Err(ButlerError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Try to send a frame without waiting for backpressure.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(ButlerError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => ButlerError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => ButlerError::ConnectionClosed,
            }
        })
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Check whether the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends when every handle is dropped, after a `Close` frame, or on
/// the first sink error.
pub fn spawn_writer_task<S>(sink: S, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: Arc::clone(&pending),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(rx, sink, pending));

    (handle, task)
}

/// Main writer loop - receives frames and writes them to the sink.
async fn writer_loop<S>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut sink: S,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            // Every handle dropped
            return Ok(());
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let closing = write_batch(&mut sink, batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);

        if closing? {
            rx.close();
            return Ok(());
        }
    }
}

/// Feed a batch into the sink and flush once.
///
/// Returns `true` if the batch contained a close frame; frames queued after
/// it are discarded.
async fn write_batch<S>(sink: &mut S, batch: Vec<OutboundFrame>) -> Result<bool>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut closing = false;

    for frame in batch {
        closing = matches!(frame, OutboundFrame::Close { .. });
        sink.feed(frame.into_message()).await?;
        if closing {
            break;
        }
    }

    sink.flush().await?;
    Ok(closing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;

    /// A sink that records messages into an mpsc channel.
    fn recording_sink() -> (
        impl Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = sink::unfold(tx, |tx, msg: Message| async move {
            let _ = tx.send(msg);
            Ok::<_, tungstenite::Error>(tx)
        });
        (Box::pin(sink), rx)
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[test]
    fn test_writer_config_from_json() {
        let config: WriterConfig =
            serde_json::from_str(r#"{"max_pending_frames": 8, "backpressure_timeout_ms": 250}"#)
                .unwrap();
        assert_eq!(config.max_pending_frames, 8);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_close_frame_conversion() {
        let msg = OutboundFrame::Close {
            code: 1000,
            reason: "bye".into(),
        }
        .into_message();
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1000);
                assert_eq!(frame.reason, "bye");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_writer_delivers_in_order() {
        let (sink, mut rx) = recording_sink();
        let (handle, _task) = spawn_writer_task(sink, WriterConfig::default());

        handle.send_text("one".into()).await.unwrap();
        handle.send_text("two".into()).await.unwrap();
        handle.send_text("three".into()).await.unwrap();

        for expected in ["one", "two", "three"] {
            assert_eq!(rx.recv().await.unwrap(), Message::Text(expected.into()));
        }
    }

    #[tokio::test]
    async fn test_close_stops_writer() {
        let (sink, mut rx) = recording_sink();
        let (handle, task) = spawn_writer_task(sink, WriterConfig::default());

        handle.send_text("last".into()).await.unwrap();
        handle.close(1000, "done").await.unwrap();

        assert!(task.await.unwrap().is_ok());
        assert_eq!(rx.recv().await.unwrap(), Message::Text("last".into()));
        assert!(matches!(rx.recv().await.unwrap(), Message::Close(Some(_))));
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send_text("late".into()).await,
            Err(ButlerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_writer_exits_when_handles_dropped() {
        let (sink, _rx) = recording_sink();
        let (handle, task) = spawn_writer_task(sink, WriterConfig::default());

        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_try_send_respects_capacity() {
        let (sink, _rx) = recording_sink();
        let config = WriterConfig {
            max_pending_frames: 0,
            ..WriterConfig::default()
        };
        let (handle, _task) = spawn_writer_task(sink, config);

        assert!(handle.is_backpressure_active());
        assert!(matches!(
            handle.try_send(OutboundFrame::Text("x".into())),
            Err(ButlerError::BackpressureTimeout)
        ));
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_times_out_under_backpressure() {
        let (sink, _rx) = recording_sink();
        let config = WriterConfig {
            max_pending_frames: 0,
            backpressure_timeout: Duration::from_millis(20),
            ..WriterConfig::default()
        };
        let (handle, _task) = spawn_writer_task(sink, config);

        let result = handle.send_text("x".into()).await;
        assert!(matches!(result, Err(ButlerError::BackpressureTimeout)));
    }
}
