//! # Event table
//!
//! Maps `(packet kind, namespace)` to a user handler. The dispatcher
//! looks handlers up by the formatted signature `"{kind}/{namespace}"`
//! and runs each hit in its own task, so a slow handler can never stall
//! dispatch.
//!
//! Stream correlation handlers (`Response`/`ResponseEnd`/`NotImplemented`
//! keyed by tag) deliberately do NOT live here; they have their own
//! pending map in the stream engine, which keeps user namespaces and
//! stream tags from ever colliding.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::inbound::Inbound;
use crate::packet::PacketKind;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A registered event handler. Handlers receive the inbound envelope and
/// may reply through it; they run on their own task.
pub type EventHandler = Arc<dyn Fn(Inbound) -> HandlerFuture + Send + Sync>;

/// Format the lookup key for a `(kind, namespace)` pair.
pub fn signature(kind: PacketKind, namespace: &str) -> String {
    format!("{}/{}", kind, namespace)
}

#[derive(Clone, Default)]
pub struct EventTable {
    inner: Arc<RwLock<HashMap<String, EventHandler>>>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; an existing handler for the same signature is
    /// replaced, keeping at most one per pair.
    pub async fn on(&self, kind: PacketKind, namespace: &str, handler: EventHandler) {
        let sig = signature(kind, namespace);
        debug!(signature = %sig, "registering event");
        if self.inner.write().await.insert(sig.clone(), handler).is_some() {
            debug!(signature = %sig, "replaced existing event handler");
        }
    }

    pub async fn off(&self, kind: PacketKind, namespace: &str) {
        let sig = signature(kind, namespace);
        debug!(signature = %sig, "removing event");
        self.inner.write().await.remove(&sig);
    }

    pub async fn lookup(&self, sig: &str) -> Option<EventHandler> {
        self.inner.read().await.get(sig).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> EventHandler {
        Arc::new(|_inbound| -> HandlerFuture { Box::pin(async {}) })
    }

    #[test]
    fn signature_formats_kind_and_namespace() {
        assert_eq!(signature(PacketKind::Request, "get_rating"), "Request/get_rating");
        assert_eq!(signature(PacketKind::Internal, "__ping"), "Internal/__ping");
    }

    #[tokio::test]
    async fn register_lookup_remove() {
        let table = EventTable::new();
        table.on(PacketKind::Message, "hello", noop()).await;

        assert!(table.lookup("Message/hello").await.is_some());
        assert!(table.lookup("Message/other").await.is_none());
        assert_eq!(table.len().await, 1);

        table.off(PacketKind::Message, "hello").await;
        assert!(table.lookup("Message/hello").await.is_none());
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn at_most_one_handler_per_signature() {
        let table = EventTable::new();
        table.on(PacketKind::Request, "get", noop()).await;
        table.on(PacketKind::Request, "get", noop()).await;
        assert_eq!(table.len().await, 1);
    }
}
