//! # Response streams
//!
//! Client-side state of multi-response requests and seeks. Every stream
//! is keyed by the originating packet's return-tag and owned by exactly
//! one task; the dispatcher, the request driver and the deadline merely
//! publish events into it. Because all teardown happens in that single
//! owner, the close sequence runs exactly once by construction — there is
//! no `closing`/`terminated` flag to race on.
//!
//! ## Lifecycle
//!
//! ```text
//! OPEN ──(counts match | NotImplemented | send failure | deadline)──▶ CLOSING
//! CLOSING: unregister tag → drop delivery sender → fire completion
//! ```
//!
//! Unregistering first closes the intake window: any `Response` still in
//! flight finds no pending entry and is logged and dropped instead of
//! racing a closing channel.
//!
//! `ResponseEnd` may legitimately arrive before the final `Response`
//! (independent tasks feed the wire on the remote side), so the end count
//! only *arms* completion; the stream keeps draining until the received
//! count matches or the deadline fires.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use crate::inbound::Inbound;

/// Terminal code of a response stream, delivered exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// The remote's announced reply count was fully received.
    Ok,
    /// The transport failed while driving the stream.
    Error,
    /// The stream's lifetime elapsed first.
    Timeout,
    /// The remote has no handler for the requested namespace.
    NotImplemented,
}

/// Events published into a stream's owner task.
pub(crate) enum StreamEvent {
    /// A `Response` packet correlated to the stream's tag.
    Response(Inbound),
    /// A `ResponseEnd` packet carrying the remote's reply count.
    End(i64),
    /// A `NotImplemented` packet for the stream's tag.
    NotImplemented,
    /// The driver failed to send the originating packet.
    Fail,
}

/// Whether end counts complete the stream (unicast request) or are per
/// responder and ignored (seek).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamMode {
    Request,
    Seek,
}

/// Engine tracking all in-flight streams by tag.
///
/// The pending map is the intake window: while a tag is present the
/// dispatcher can reach the stream; removal is the first step of closing.
#[derive(Clone)]
pub struct StreamEngine {
    pending: Arc<RwLock<HashMap<String, mpsc::Sender<StreamEvent>>>>,
    buffer: usize,
}

impl StreamEngine {
    pub fn new(buffer: usize) -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            buffer,
        }
    }

    /// Create a stream for `tag` and spawn its owner task.
    pub(crate) async fn open(
        &self,
        tag: String,
        mode: StreamMode,
        lifetime: Duration,
    ) -> ResponseStream {
        let (event_tx, event_rx) = mpsc::channel(self.buffer);
        let (delivery_tx, delivery_rx) = mpsc::channel(self.buffer);
        let (completion_tx, completion_rx) = oneshot::channel();

        self.pending.write().await.insert(tag.clone(), event_tx);

        tokio::spawn(run_stream(
            tag.clone(),
            mode,
            lifetime,
            event_rx,
            delivery_tx,
            completion_tx,
            self.pending.clone(),
        ));

        ResponseStream {
            tag,
            delivery: delivery_rx,
            completion: Some(completion_rx),
            result: None,
        }
    }

    /// Publish an event to the stream registered under `tag`. Returns
    /// false when the intake window is already closed (or never existed);
    /// the packet behind such an event is simply dropped.
    pub(crate) async fn publish(&self, tag: &str, event: StreamEvent) -> bool {
        let sender = self.pending.read().await.get(tag).cloned();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Number of in-flight streams. After a stream closes its tag must be
    /// gone from here.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn is_pending(&self, tag: &str) -> bool {
        self.pending.read().await.contains_key(tag)
    }
}

/// The single owner of one stream's mutable state.
async fn run_stream(
    tag: String,
    mode: StreamMode,
    lifetime: Duration,
    mut events: mpsc::Receiver<StreamEvent>,
    delivery: mpsc::Sender<Inbound>,
    completion: oneshot::Sender<StreamEnd>,
    pending: Arc<RwLock<HashMap<String, mpsc::Sender<StreamEvent>>>>,
) {
    let mut seen = HashSet::new();
    let mut received: i64 = 0;
    // Unknown until the remote's ResponseEnd reports it.
    let mut expected: i64 = -1;

    let deadline = tokio::time::sleep(lifetime);
    tokio::pin!(deadline);

    let terminal = loop {
        tokio::select! {
            () = &mut deadline => {
                debug!(tag = %tag, "stream lifetime elapsed");
                break StreamEnd::Timeout;
            }
            event = events.recv() => match event {
                // The engine itself dropped; nothing sensible remains.
                None => break StreamEnd::Error,

                Some(StreamEvent::Response(inbound)) => {
                    let packet_tag = inbound.packet().return_tag().to_string();
                    if !seen.insert(packet_tag.clone()) {
                        debug!(tag = %tag, packet = %packet_tag, "duplicate response discarded");
                        continue;
                    }

                    // A gone consumer only means nobody reads the items;
                    // the count still advances so the stream can finish.
                    let _ = delivery.send(inbound).await;
                    received += 1;

                    if mode == StreamMode::Request && expected >= 0 && expected == received {
                        debug!(tag = %tag, count = received, "all responses arrived");
                        break StreamEnd::Ok;
                    }
                }

                Some(StreamEvent::End(count)) => {
                    if mode == StreamMode::Seek {
                        debug!(tag = %tag, count, "seek responder finished");
                        continue;
                    }
                    expected = count;
                    if expected == received {
                        debug!(tag = %tag, count = received, "all responses arrived");
                        break StreamEnd::Ok;
                    }
                    debug!(
                        tag = %tag,
                        expected,
                        received,
                        "end count arrived before all responses, draining"
                    );
                }

                Some(StreamEvent::NotImplemented) => {
                    if mode == StreamMode::Seek {
                        // Other peers may still implement the namespace;
                        // a seek only ends on deadline or send failure.
                        debug!(tag = %tag, "seek peer does not implement namespace");
                        continue;
                    }
                    warn!(tag = %tag, "request not implemented by remote peer");
                    break StreamEnd::NotImplemented;
                }

                Some(StreamEvent::Fail) => break StreamEnd::Error,
            }
        }
    };

    // CLOSING. Unregister first: from here on the dispatcher drops any
    // late packet instead of feeding a channel that is about to close.
    pending.write().await.remove(&tag);
    drop(delivery);
    let _ = completion.send(terminal);
    debug!(tag = %tag, code = ?terminal, "response stream terminated");
}

/// Caller-side handle of one in-flight request or seek.
pub struct ResponseStream {
    tag: String,
    delivery: mpsc::Receiver<Inbound>,
    completion: Option<oneshot::Receiver<StreamEnd>>,
    result: Option<StreamEnd>,
}

impl ResponseStream {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Next response, in arrival order. `None` once the stream has closed
    /// and all delivered items were drained.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.delivery.recv().await
    }

    /// Wait for the terminal code. Idempotent: the code is cached after
    /// the first await, and it is delivered exactly once by the owner.
    pub async fn done(&mut self) -> StreamEnd {
        if let Some(rx) = self.completion.take() {
            self.result = Some(rx.await.unwrap_or(StreamEnd::Error));
        }
        self.result.unwrap_or(StreamEnd::Error)
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("tag", &self.tag)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn end_count_zero_closes_with_ok() {
        let engine = StreamEngine::new(16);
        let mut stream = engine
            .open("t1".into(), StreamMode::Request, Duration::from_secs(5))
            .await;

        assert!(engine.publish("t1", StreamEvent::End(0)).await);
        assert_eq!(stream.done().await, StreamEnd::Ok);
        assert!(stream.recv().await.is_none());
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn not_implemented_closes_request() {
        let engine = StreamEngine::new(16);
        let mut stream = engine
            .open("t2".into(), StreamMode::Request, Duration::from_secs(5))
            .await;

        assert!(engine.publish("t2", StreamEvent::NotImplemented).await);
        assert_eq!(stream.done().await, StreamEnd::NotImplemented);
        assert!(!engine.is_pending("t2").await);
    }

    #[tokio::test]
    async fn send_failure_closes_with_error() {
        let engine = StreamEngine::new(16);
        let mut stream = engine
            .open("t3".into(), StreamMode::Request, Duration::from_secs(5))
            .await;

        assert!(engine.publish("t3", StreamEvent::Fail).await);
        assert_eq!(stream.done().await, StreamEnd::Error);
    }

    #[tokio::test]
    async fn silence_closes_with_timeout() {
        let engine = StreamEngine::new(16);
        let mut stream = engine.open("t4".into(), StreamMode::Request, FAST).await;

        assert_eq!(stream.done().await, StreamEnd::Timeout);
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn seek_ignores_end_counts_and_not_implemented() {
        let engine = StreamEngine::new(16);
        let mut stream = engine.open("t5".into(), StreamMode::Seek, FAST).await;

        // Individual responders finishing (or lacking the namespace) must
        // not close a seek; only the deadline does.
        assert!(engine.publish("t5", StreamEvent::End(0)).await);
        assert!(engine.publish("t5", StreamEvent::NotImplemented).await);
        assert_eq!(stream.done().await, StreamEnd::Timeout);
    }

    #[tokio::test]
    async fn publish_to_unknown_tag_is_dropped() {
        let engine = StreamEngine::new(16);
        assert!(!engine.publish("missing", StreamEvent::End(0)).await);
    }

    #[tokio::test]
    async fn terminal_code_is_cached() {
        let engine = StreamEngine::new(16);
        let mut stream = engine
            .open("t6".into(), StreamMode::Request, Duration::from_secs(5))
            .await;

        engine.publish("t6", StreamEvent::End(0)).await;
        assert_eq!(stream.done().await, StreamEnd::Ok);
        assert_eq!(stream.done().await, StreamEnd::Ok);
    }

    #[tokio::test]
    async fn intake_closes_before_completion_fires() {
        let engine = StreamEngine::new(16);
        let mut stream = engine
            .open("t7".into(), StreamMode::Request, Duration::from_secs(5))
            .await;

        engine.publish("t7", StreamEvent::End(0)).await;
        assert_eq!(stream.done().await, StreamEnd::Ok);

        // Late events for a closed tag are rejected at the intake.
        assert!(!engine.publish("t7", StreamEvent::End(0)).await);
    }
}
