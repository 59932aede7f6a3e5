//! Transport seam and the in-process bus.
//!
//! A [`Transport`] hands outbound envelopes to some point-to-point channel.
//! Inbound traffic flows the other way as raw frame bodies on an
//! `mpsc::UnboundedReceiver<Vec<u8>>`, which a [`Node`](crate::node::Node)
//! drains with [`spawn_receive_loop`](crate::node::spawn_receive_loop).

use crate::error::TransportError;
use crate::message::{encode_envelope, Envelope};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound hand-off to an underlying message channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver an envelope towards the node named by its target address.
    ///
    /// An error here means the envelope was not handed off at all.
    async fn deliver_outbound(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Release connections and stop background work.
    async fn shutdown(&self) {}
}

/// The node name an envelope must be delivered to.
pub(crate) fn destination_node(envelope: &Envelope) -> Result<&str, TransportError> {
    envelope.target().map(|t| t.node()).ok_or_else(|| {
        TransportError::Unreachable(format!("envelope {} carries no target", envelope.id))
    })
}

/// In-process message bus keyed by node name.
///
/// Each attached node gets an unbounded channel of raw envelope bodies.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    routes: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node, replacing any previous attachment under that name.
    pub fn attach(&self, node: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.insert(node.to_string(), tx);
        debug!(node, "Attached node to memory bus");
        rx
    }

    /// Detach a node. Envelopes sent to it afterwards fail as unreachable.
    pub fn detach(&self, node: &str) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.remove(node);
    }

    pub fn is_attached(&self, node: &str) -> bool {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.contains_key(node)
    }

    /// A transport that delivers through this bus.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { bus: self.clone() }
    }

    /// Push raw bytes to a node as if they had arrived off the wire.
    pub fn inject(&self, node: &str, raw: Vec<u8>) -> Result<(), TransportError> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        let tx = routes
            .get(node)
            .ok_or_else(|| TransportError::Unreachable(node.to_string()))?;
        tx.send(raw)
            .map_err(|_| TransportError::Unreachable(node.to_string()))
    }
}

/// [`Transport`] over a [`MemoryBus`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    bus: MemoryBus,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn deliver_outbound(&self, envelope: Envelope) -> Result<(), TransportError> {
        let node = destination_node(&envelope)?;
        let body = encode_envelope(&envelope)?;
        self.bus.inject(node, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{decode_envelope, CorrelationId};
    use hyperwire_types::Address;

    fn request_to(node: &str) -> Envelope {
        Envelope::request(
            CorrelationId(1),
            Address::parse("alice.os@chat:app:alice.os").unwrap(),
            Address::parse(&format!("{node}@chat:app:alice.os")).unwrap(),
            b"ping".to_vec(),
            true,
        )
    }

    #[tokio::test]
    async fn test_delivers_to_attached_node() {
        let bus = MemoryBus::new();
        let mut rx = bus.attach("bob.os");
        let transport = bus.transport();

        transport.deliver_outbound(request_to("bob.os")).await.unwrap();

        let raw = rx.recv().await.unwrap();
        let decoded = decode_envelope(&raw).unwrap();
        assert_eq!(decoded, request_to("bob.os"));
    }

    #[tokio::test]
    async fn test_unknown_node_is_unreachable() {
        let bus = MemoryBus::new();
        let transport = bus.transport();

        let err = transport
            .deliver_outbound(request_to("nobody.os"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(ref n) if n == "nobody.os"));
    }

    #[tokio::test]
    async fn test_detached_or_dropped_receiver_is_unreachable() {
        let bus = MemoryBus::new();
        let transport = bus.transport();

        let rx = bus.attach("bob.os");
        drop(rx);
        assert!(transport.deliver_outbound(request_to("bob.os")).await.is_err());

        let _rx = bus.attach("carol.os");
        bus.detach("carol.os");
        assert!(!bus.is_attached("carol.os"));
        assert!(transport.deliver_outbound(request_to("carol.os")).await.is_err());
    }
}
