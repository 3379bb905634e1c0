//! Readiness-gated pipe between an upload producer and the transport.
//!
//! # Design
//! The transport pulls the request body through `BridgeBody`, a `Stream` of
//! chunks. Each poll that finds nothing to deliver flips the bridge to
//! `Ready` and wakes the producer; `BridgeWriter::write` then hands over at
//! most `capacity` bytes as the single pending chunk and drops the bridge
//! back to `Idle`. A payload larger than one readiness window therefore
//! crosses over several readiness events.
//!
//! `Closed` is terminal. It is reached when the body reaches end of stream,
//! when the producer aborts, or when the transport drops the body before end
//! of stream. The two error paths notify the failure listener exactly once.
//! Polls and writes after `Closed` never change state: the former yield
//! end of stream, the latter fail with `NetworkError::StreamClosed`.
//!
//! The state lives behind one `std::sync::Mutex` that is never held across
//! an await point, so readiness flips and closes are atomic with respect to
//! each other.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::error::NetworkError;

/// Observable phase of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// The consumer has not asked for more bytes.
    Idle,
    /// The consumer can accept one write of up to `capacity` bytes.
    Ready,
    Closed,
}

struct Inner {
    state: BridgeState,
    capacity: usize,
    pending: Option<Bytes>,
    finished: bool,
    delivered: u64,
    consumer_error: Option<NetworkError>,
    consumer_waker: Option<Waker>,
    failure_listener: Option<oneshot::Sender<NetworkError>>,
}

struct Shared {
    inner: Mutex<Inner>,
    writable: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `Closed` because of `err`. Later calls are no-ops.
    fn fail(&self, err: NetworkError) {
        let waker = {
            let mut inner = self.lock();
            if inner.state == BridgeState::Closed {
                return;
            }
            debug!(error = %err, delivered = inner.delivered, "upload bridge closed with error");
            inner.state = BridgeState::Closed;
            inner.pending = None;
            inner.consumer_error = Some(err.clone());
            if let Some(listener) = inner.failure_listener.take() {
                let _ = listener.send(err);
            }
            inner.consumer_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        self.writable.notify_one();
    }
}

/// An unsplit bridge. Register a failure listener, then `split` it.
pub struct StreamBridge {
    shared: Arc<Shared>,
}

impl StreamBridge {
    /// `capacity` is the most bytes accepted per readiness event; zero is
    /// treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: BridgeState::Idle,
                    capacity: capacity.max(1),
                    pending: None,
                    finished: false,
                    delivered: 0,
                    consumer_error: None,
                    consumer_waker: None,
                    failure_listener: None,
                }),
                writable: Notify::new(),
            }),
        }
    }

    /// Receiver resolved once if the bridge closes because of an error.
    ///
    /// Registering again replaces the previous listener, whose receiver then
    /// resolves with a `RecvError`.
    pub fn on_failure(&self) -> oneshot::Receiver<NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.shared.lock().failure_listener = Some(tx);
        rx
    }

    pub fn state(&self) -> BridgeState {
        self.shared.lock().state
    }

    /// Read-only view that stays valid after both halves are gone.
    pub fn monitor(&self) -> BridgeMonitor {
        BridgeMonitor {
            shared: self.shared.clone(),
        }
    }

    /// Producer and consumer halves. Both always exist together.
    pub fn split(self) -> (BridgeWriter, BridgeBody) {
        (
            BridgeWriter {
                shared: self.shared.clone(),
                finished: false,
            },
            BridgeBody { shared: self.shared },
        )
    }
}

/// Producer half. Writes only while the consumer has signalled readiness.
pub struct BridgeWriter {
    shared: Arc<Shared>,
    finished: bool,
}

impl BridgeWriter {
    /// Write up to one readiness window of `data`, waiting for readiness.
    ///
    /// Returns the number of bytes accepted, which may be less than
    /// `data.len()`.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, NetworkError> {
        if data.is_empty() {
            return Ok(0);
        }
        loop {
            let accepted = {
                let mut inner = self.shared.lock();
                let state = inner.state;
                match state {
                    BridgeState::Closed => return Err(NetworkError::StreamClosed),
                    BridgeState::Ready if inner.pending.is_none() => {
                        let n = data.len().min(inner.capacity);
                        inner.pending = Some(Bytes::copy_from_slice(&data[..n]));
                        inner.state = BridgeState::Idle;
                        Some((n, inner.consumer_waker.take()))
                    }
                    _ => None,
                }
            };
            match accepted {
                Some((n, waker)) => {
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                    return Ok(n);
                }
                None => self.shared.writable.notified().await,
            }
        }
    }

    /// Write all of `data` across as many readiness events as it takes.
    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<(), NetworkError> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Signal end of stream once the pending chunk has been consumed.
    pub fn finish(mut self) {
        self.finished = true;
        let waker = {
            let mut inner = self.shared.lock();
            if inner.state == BridgeState::Closed {
                return;
            }
            inner.finished = true;
            inner.consumer_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Tear the stream down; the consumer sees `err` and then end of stream.
    pub fn abort(mut self, err: NetworkError) {
        self.finished = true;
        self.shared.fail(err);
    }

    /// Whether a write would be accepted without waiting.
    pub fn can_write(&self) -> bool {
        let inner = self.shared.lock();
        inner.state == BridgeState::Ready && inner.pending.is_none()
    }

    /// Bytes the consumer has taken so far.
    pub fn delivered(&self) -> u64 {
        self.shared.lock().delivered
    }

    pub fn state(&self) -> BridgeState {
        self.shared.lock().state
    }
}

impl Drop for BridgeWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.shared
                .fail(NetworkError::Transport("upload producer dropped before end of stream".into()));
        }
    }
}

/// Observer of a bridge's progress.
#[derive(Clone)]
pub struct BridgeMonitor {
    shared: Arc<Shared>,
}

impl BridgeMonitor {
    /// Bytes the consumer has taken so far.
    pub fn delivered(&self) -> u64 {
        self.shared.lock().delivered
    }

    pub fn state(&self) -> BridgeState {
        self.shared.lock().state
    }
}

impl fmt::Debug for BridgeMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("BridgeMonitor")
            .field("state", &inner.state)
            .field("delivered", &inner.delivered)
            .finish()
    }
}

/// Consumer half, handed to the transport as the request body.
pub struct BridgeBody {
    shared: Arc<Shared>,
}

impl Stream for BridgeBody {
    type Item = Result<Bytes, NetworkError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut inner = self.shared.lock();
        if let Some(chunk) = inner.pending.take() {
            inner.delivered += chunk.len() as u64;
            return Poll::Ready(Some(Ok(chunk)));
        }
        let state = inner.state;
        match state {
            BridgeState::Closed => Poll::Ready(inner.consumer_error.take().map(Err)),
            _ if inner.finished => {
                inner.state = BridgeState::Closed;
                drop(inner);
                self.shared.writable.notify_one();
                Poll::Ready(None)
            }
            _ => {
                inner.state = BridgeState::Ready;
                inner.consumer_waker = Some(cx.waker().clone());
                drop(inner);
                self.shared.writable.notify_one();
                Poll::Pending
            }
        }
    }
}

impl Drop for BridgeBody {
    fn drop(&mut self) {
        self.shared
            .fail(NetworkError::Transport("transport released the request body early".into()));
    }
}

impl fmt::Debug for BridgeBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("BridgeBody")
            .field("state", &inner.state)
            .field("capacity", &inner.capacity)
            .field("delivered", &inner.delivered)
            .finish()
    }
}

impl fmt::Debug for BridgeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeWriter")
            .field("state", &self.state())
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    async fn drain(mut body: BridgeBody) -> (Vec<u8>, usize) {
        let mut out = Vec::new();
        let mut chunks = 0;
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
            chunks += 1;
        }
        (out, chunks)
    }

    #[tokio::test]
    async fn payload_spans_several_readiness_events() {
        let (mut writer, body) = StreamBridge::new(4).split();
        let consumer = tokio::spawn(drain(body));

        let payload: Vec<u8> = (0..10).collect();
        writer.write_all(&payload).await.unwrap();
        writer.finish();

        let (received, chunks) = consumer.await.unwrap();
        assert_eq!(received, payload);
        assert_eq!(chunks, 3);
    }

    #[tokio::test]
    async fn write_waits_for_readiness() {
        let (mut writer, mut body) = StreamBridge::new(8).split();
        assert_eq!(writer.state(), BridgeState::Idle);
        assert!(!writer.can_write());

        let write = tokio::spawn(async move {
            let n = writer.write(b"abcdefghijkl").await.unwrap();
            (writer, n)
        });
        let first = body.next().await.unwrap().unwrap();
        let (writer, n) = write.await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(&first[..], b"abcdefgh");
        assert_eq!(writer.delivered(), 8);
        writer.finish();
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let (mut writer, body) = StreamBridge::new(8).split();
        drop(body);
        assert_eq!(writer.state(), BridgeState::Closed);
        assert_eq!(writer.write(b"late").await, Err(NetworkError::StreamClosed));
    }

    #[tokio::test]
    async fn consumer_teardown_notifies_listener_once() {
        let bridge = StreamBridge::new(8);
        let failure = bridge.on_failure();
        let (mut writer, body) = bridge.split();

        let pending_write = tokio::spawn(async move {
            let result = writer.write_all(&[7u8; 64]).await;
            (writer, result)
        });
        tokio::task::yield_now().await;
        drop(body);

        let (writer, result) = pending_write.await.unwrap();
        assert_eq!(result, Err(NetworkError::StreamClosed));
        assert!(matches!(failure.await, Ok(NetworkError::Transport(_))));
        drop(writer);
    }

    #[tokio::test]
    async fn abort_surfaces_error_to_consumer() {
        let bridge = StreamBridge::new(8);
        let failure = bridge.on_failure();
        let (writer, mut body) = bridge.split();
        writer.abort(NetworkError::Transport("disk gone".into()));

        assert_eq!(
            body.next().await.unwrap(),
            Err(NetworkError::Transport("disk gone".into()))
        );
        assert!(body.next().await.is_none());
        assert!(body.next().await.is_none());
        assert_eq!(failure.await.unwrap(), NetworkError::Transport("disk gone".into()));
    }

    #[tokio::test]
    async fn clean_finish_does_not_report_failure() {
        let bridge = StreamBridge::new(8);
        let mut failure = bridge.on_failure();
        let monitor = bridge.monitor();
        let (mut writer, body) = bridge.split();
        let consumer = tokio::spawn(drain(body));
        writer.write_all(b"done").await.unwrap();
        writer.finish();
        let (received, _) = consumer.await.unwrap();
        assert_eq!(received, b"done");
        assert!(failure.try_recv().is_err());
        assert_eq!(monitor.delivered(), 4);
        assert_eq!(monitor.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn dropped_writer_closes_stream() {
        let (writer, mut body) = StreamBridge::new(8).split();
        drop(writer);
        assert!(matches!(body.next().await, Some(Err(NetworkError::Transport(_)))));
        assert!(body.next().await.is_none());
    }
}
