//! Node: one process's endpoint on the network.
//!
//! A [`Node`] owns a [`Correlator`] for the requests it sends and a
//! [`Router`] for the requests it serves, both bound to the node's own
//! address. Inbound frames arrive through [`Node::on_inbound`]: responses are
//! routed to the correlator inline, requests are dispatched on their own task
//! so a slow handler never stalls the receive loop.

use crate::codec::{decode_body, encode_call};
use crate::correlator::{Correlator, ResponseHandle};
use crate::error::{RpcError, TransportError};
use crate::message::{decode_envelope, CorrelationId, Envelope, EnvelopeKind, WireRequest};
use crate::registry::PeerDirectory;
use crate::router::{RequestContext, Router};
use crate::tcp::TcpTransport;
use crate::transport::Transport;
use hyperwire_types::{Address, NodeConfig};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default timeout for [`Node::call`] and [`Node::send`] without an explicit one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

struct NodeInner {
    our: Address,
    correlator: Correlator,
    router: Router,
    transport: Arc<dyn Transport>,
    default_timeout_ms: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A running endpoint. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Create a node that sends through `transport` and serves `router`.
    pub fn new(our: Address, transport: Arc<dyn Transport>, router: Router) -> Self {
        let correlator = Correlator::new(our.clone(), Arc::clone(&transport));
        Self {
            inner: Arc::new(NodeInner {
                our,
                correlator,
                router,
                transport,
                default_timeout_ms: AtomicU64::new(duration_ms(DEFAULT_TIMEOUT)),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Set the timeout used when callers do not give one. Every clone of
    /// this node sees the new value.
    pub fn set_default_timeout(&self, timeout: Duration) {
        self.inner
            .default_timeout_ms
            .store(duration_ms(timeout), Ordering::Relaxed);
    }

    /// Build a TCP node from configuration: bind the listener, start the
    /// receive loop and the expiry sweeper.
    pub async fn start_tcp(
        config: &NodeConfig,
        router: Router,
    ) -> Result<(Node, SocketAddr), TransportError> {
        let (our, transport, inbound) = tcp_parts(config)?;
        let (local_addr, accept_task) = transport.listen(config.listen_addr).await?;

        let node = Node::launch(our, transport, inbound, router, config);
        node.track(accept_task);

        info!("Node {} started on {}", node.our(), local_addr);
        Ok((node, local_addr))
    }

    /// Build a TCP node that only dials out: no listener is bound, so it can
    /// run next to a serving node with the same configuration. Peers answer
    /// over the connections this node opens.
    pub fn start_tcp_client(config: &NodeConfig, router: Router) -> Result<Node, TransportError> {
        let (our, transport, inbound) = tcp_parts(config)?;
        let node = Node::launch(our, transport, inbound, router, config);

        info!("Node {} started without a listener", node.our());
        Ok(node)
    }

    fn launch(
        our: Address,
        transport: TcpTransport,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        router: Router,
        config: &NodeConfig,
    ) -> Node {
        let node = Node::new(our, Arc::new(transport), router);
        node.set_default_timeout(config.default_timeout());
        node.track(spawn_receive_loop(node.clone(), inbound));
        node.track(node.inner.correlator.spawn_sweeper(config.sweep_interval()));
        node
    }

    /// Keep a background task alive until [`Node::shutdown`].
    pub fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// This node's own address.
    pub fn our(&self) -> &Address {
        &self.inner.our
    }

    /// Pending-request table for calls this node sends.
    pub fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    /// Handlers serving requests addressed to this node.
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Timeout applied when a caller passes `None`.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.default_timeout_ms.load(Ordering::Relaxed))
    }

    /// Send raw bytes and wait for the response.
    pub async fn send(
        &self,
        target: Address,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RpcError> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        self.inner.correlator.send(target, payload, timeout).await
    }

    /// Send raw bytes and return a handle for the pending response.
    pub async fn start_request(
        &self,
        target: Address,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<ResponseHandle, RpcError> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        self.inner
            .correlator
            .start_request(target, payload, timeout)
            .await
    }

    /// Send raw bytes without expecting a response.
    pub async fn send_fire_and_forget(
        &self,
        target: Address,
        payload: Vec<u8>,
    ) -> Result<(), RpcError> {
        self.inner
            .correlator
            .send_fire_and_forget(target, payload)
            .await
    }

    /// Call `method` on `target` with typed arguments and response.
    pub async fn call<A, R>(
        &self,
        target: Address,
        method: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = encode_call(method, args)?;
        let body = self.send(target, payload, timeout).await?;
        Ok(decode_body(&body)?)
    }

    /// Handle one raw inbound message. Malformed input is logged and dropped.
    pub fn on_inbound(&self, raw: &[u8]) {
        match decode_envelope(raw) {
            Ok(envelope) => self.on_envelope(envelope),
            Err(e) => {
                warn!(
                    "Node {}: dropping malformed inbound message ({} bytes): {}",
                    self.inner.our,
                    raw.len(),
                    e
                );
            }
        }
    }

    /// Handle one decoded inbound envelope.
    pub fn on_envelope(&self, envelope: Envelope) {
        let id = envelope.id;
        match envelope.kind {
            EnvelopeKind::Response(resp) => {
                if resp.target.node() != self.inner.our.node() {
                    warn!("Dropping response {} addressed to {}", id, resp.target);
                    return;
                }
                self.inner
                    .correlator
                    .on_response(id, &resp.source, resp.result.into());
            }
            EnvelopeKind::Request(req) => {
                if req.target.node() != self.inner.our.node() {
                    warn!("Dropping request {} addressed to {}", id, req.target);
                    return;
                }
                let node = self.clone();
                let task = tokio::spawn(async move {
                    node.serve_request(id, req).await;
                });
                self.track(task);
            }
            other => {
                warn!("Dropping unexpected envelope {}: {:?}", id, other);
            }
        }
    }

    async fn serve_request(&self, id: CorrelationId, req: WireRequest) {
        let ctx = RequestContext {
            our: self.inner.our.clone(),
            source: req.source.clone(),
            id,
            expects_response: req.expects_response,
        };

        let result = if req.target.process() != self.inner.our.process() {
            Err(format!("no such process: {}", req.target.process()))
        } else {
            self.inner.router.dispatch(&ctx, &req.payload).await
        };

        if !req.expects_response {
            if let Err(reason) = result {
                debug!("Fire-and-forget request {} from {} failed: {}", id, req.source, reason);
            }
            return;
        }

        let response = Envelope::response(id, self.inner.our.clone(), req.source.clone(), result);
        if let Err(e) = self.inner.transport.deliver_outbound(response).await {
            warn!("Failed to deliver response {} to {}: {}", id, req.source, e);
        }
    }

    /// Fail outstanding requests, stop background tasks and in-flight
    /// handlers, and release the transport.
    pub async fn shutdown(&self) {
        let failed = self.inner.correlator.shutdown();
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        self.inner.transport.shutdown().await;
        info!("Node {} shut down ({} pending requests failed)", self.inner.our, failed);
    }
}

fn duration_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Validate `config` and build its unstarted TCP transport.
fn tcp_parts(
    config: &NodeConfig,
) -> Result<(Address, TcpTransport, mpsc::UnboundedReceiver<Vec<u8>>), TransportError> {
    config
        .validate()
        .map_err(|e| TransportError::Config(e.to_string()))?;
    let our = config
        .our()
        .map_err(|e| TransportError::Config(e.to_string()))?;
    let directory = PeerDirectory::from_config(&config.peers);
    let (transport, inbound) = TcpTransport::new(&config.node, &config.shared_secret, directory);
    Ok((our, transport, inbound))
}

/// Feed every raw message from `inbound` to `node` until the channel closes.
pub fn spawn_receive_loop(node: Node, mut inbound: mpsc::UnboundedReceiver<Vec<u8>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raw) = inbound.recv().await {
            node.on_inbound(&raw);
        }
        debug!("Receive loop for {} ended", node.our());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{args, encode_unit};
    use crate::message::{encode_envelope, CorrelationId};
    use crate::router::handler_fn;
    use crate::transport::MemoryBus;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn attach(bus: &MemoryBus, our: &str, router: Router) -> Node {
        let our = addr(our);
        let rx = bus.attach(our.node());
        let node = Node::new(our, Arc::new(bus.transport()), router);
        node.track(spawn_receive_loop(node.clone(), rx));
        node
    }

    fn echo_router() -> Router {
        Router::new()
            .route(
                "Echo",
                handler_fn(|_ctx, raw| async move { Ok::<Value, String>(raw) }),
            )
            .route(
                "Whoami",
                handler_fn(|ctx, _raw| async move {
                    Ok::<Value, String>(json!([ctx.our.to_string(), ctx.source.to_string()]))
                }),
            )
    }

    #[tokio::test]
    async fn test_call_between_nodes() {
        let bus = MemoryBus::new();
        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());
        let bob = attach(&bus, "bob.os@chat:app:alice.os", echo_router());

        let reply: String = alice
            .call(bob.our().clone(), "Echo", "hi", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply, "hi");

        let (our, source): (String, String) = alice
            .call(bob.our().clone(), "Whoami", &(), None)
            .await
            .unwrap();
        assert_eq!(our, "bob.os@chat:app:alice.os");
        assert_eq!(source, "alice.os@chat:app:alice.os");
        assert_eq!(alice.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_pong_scenario() {
        let bus = MemoryBus::new();
        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());
        let bob = attach(
            &bus,
            "bob.os@chat:app:alice.os",
            Router::new().route(
                "ping",
                handler_fn(|_ctx, _raw| async move { Ok::<Value, String>(json!("pong")) }),
            ),
        );

        let body = alice
            .send(bob.our().clone(), encode_unit("ping").unwrap(), Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(body, br#""pong""#);
    }

    #[tokio::test]
    async fn test_unknown_method_is_remote_error() {
        let bus = MemoryBus::new();
        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());
        let bob = attach(&bus, "bob.os@chat:app:alice.os", echo_router());

        let err = alice
            .call::<_, Value>(bob.our().clone(), "Nope", &(), Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        match err {
            RpcError::Remote(reason) => assert!(reason.contains("no handler"), "{reason}"),
            other => panic!("Expected Remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_process_is_remote_error() {
        let bus = MemoryBus::new();
        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());
        let _bob = attach(&bus, "bob.os@chat:app:alice.os", echo_router());

        let err = alice
            .call::<_, Value>(addr("bob.os@files:app:alice.os"), "Echo", "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref r) if r.contains("no such process")));
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_immediately() {
        let bus = MemoryBus::new();
        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());

        let err = alice
            .send(addr("ghost.os@chat:app:alice.os"), Vec::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Transport(TransportError::Unreachable(ref n)) if n == "ghost.os"
        ));
        assert_eq!(alice.correlator().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let bus = MemoryBus::new();
        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());
        // Attached but never drained: requests are accepted and never answered.
        let _silent = bus.attach("bob.os");

        let err = alice
            .send(
                addr("bob.os@chat:app:alice.os"),
                Vec::new(),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(alice.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fire_and_forget_is_dispatched_without_reply() {
        let bus = MemoryBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());

        let router = {
            let hits = Arc::clone(&hits);
            let done = Arc::clone(&done);
            Router::new().route(
                "Note",
                handler_fn(move |ctx, raw| {
                    let hits = Arc::clone(&hits);
                    let done = Arc::clone(&done);
                    async move {
                        assert!(!ctx.expects_response);
                        let text: String = args(raw)?;
                        assert_eq!(text, "remember this");
                        hits.fetch_add(1, Ordering::SeqCst);
                        done.notify_one();
                        Ok::<Value, String>(Value::Null)
                    }
                }),
            )
        };

        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());
        let bob = attach(&bus, "bob.os@chat:app:alice.os", router);

        alice
            .send_fire_and_forget(
                bob.our().clone(),
                crate::codec::encode_call("Note", "remember this").unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(alice.correlator().pending_count(), 0);

        done.notified().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_inbound_is_dropped() {
        let bus = MemoryBus::new();
        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());
        let bob = attach(&bus, "bob.os@chat:app:alice.os", echo_router());

        bus.inject("bob.os", b"garbage".to_vec()).unwrap();
        bus.inject("bob.os", br#"{"id":3,"type":"hello"}"#.to_vec()).unwrap();

        // The receive loop survives and keeps serving.
        let reply: String = alice
            .call(bob.our().clone(), "Echo", "still here", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply, "still here");
    }

    #[tokio::test]
    async fn test_unmatched_response_is_ignored() {
        let bus = MemoryBus::new();
        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());

        let stray = Envelope::response(
            CorrelationId(12345),
            addr("bob.os@chat:app:alice.os"),
            alice.our().clone(),
            Ok(b"late".to_vec()),
        );
        alice.on_inbound(&encode_envelope(&stray).unwrap());
        assert_eq!(alice.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_from_many_tasks() {
        let bus = MemoryBus::new();
        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());
        let bob = attach(&bus, "bob.os@chat:app:alice.os", echo_router());

        let mut tasks = Vec::new();
        for i in 0..20u32 {
            let alice = alice.clone();
            let target = bob.our().clone();
            tasks.push(tokio::spawn(async move {
                let reply: u32 = alice
                    .call(target, "Echo", &i, Some(Duration::from_secs(5)))
                    .await
                    .unwrap();
                (i, reply)
            }));
        }
        for task in tasks {
            let (sent, received) = task.await.unwrap();
            assert_eq!(sent, received);
        }
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_calls() {
        let bus = MemoryBus::new();
        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());
        let _silent = bus.attach("bob.os");

        let handle = alice
            .start_request(addr("bob.os@chat:app:alice.os"), Vec::new(), None)
            .await
            .unwrap();
        alice.shutdown().await;

        assert!(matches!(handle.wait().await, Err(RpcError::Shutdown)));
        assert!(alice.correlator().is_shut_down());
    }

    #[test]
    fn test_default_timeout_override_reaches_clones() {
        let bus = MemoryBus::new();
        let node = Node::new(
            addr("alice.os@chat:app:alice.os"),
            Arc::new(bus.transport()),
            Router::new(),
        );
        let clone = node.clone();
        assert_eq!(clone.default_timeout(), DEFAULT_TIMEOUT);

        node.set_default_timeout(Duration::from_secs(3));
        assert_eq!(node.default_timeout(), Duration::from_secs(3));
        assert_eq!(clone.default_timeout(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_applies_to_send() {
        let bus = MemoryBus::new();
        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());
        let _silent = bus.attach("bob.os");
        alice.clone().set_default_timeout(Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        let err = alice
            .send(addr("bob.os@chat:app:alice.os"), Vec::new(), None)
            .await
            .unwrap_err();
        match err {
            RpcError::Timeout { after, .. } => assert_eq!(after, Duration::from_secs(2)),
            other => panic!("Expected Timeout, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_response_from_wrong_node_does_not_resolve() {
        let bus = MemoryBus::new();
        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());
        let mut bob_rx = bus.attach("bob.os");

        let handle = alice
            .start_request(
                addr("bob.os@chat:app:alice.os"),
                b"ping".to_vec(),
                Some(Duration::from_secs(30)),
            )
            .await
            .unwrap();
        let id = handle.id();
        let sent = decode_envelope(&bob_rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent.id, id);

        // Carol guesses the id and answers in bob's place.
        let forged = Envelope::response(
            id,
            addr("carol.os@chat:app:alice.os"),
            alice.our().clone(),
            Ok(b"forged".to_vec()),
        );
        alice.on_inbound(&encode_envelope(&forged).unwrap());
        assert!(alice.correlator().is_pending(id));

        let genuine = Envelope::response(
            id,
            addr("bob.os@chat:app:alice.os"),
            alice.our().clone(),
            Ok(b"pong".to_vec()),
        );
        alice.on_inbound(&encode_envelope(&genuine).unwrap());
        assert_eq!(handle.wait().await.unwrap(), b"pong");
    }

    /// Sets its flag when dropped, i.e. when the owning task is aborted.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_shutdown_aborts_running_handlers() {
        let bus = MemoryBus::new();
        let started = Arc::new(Notify::new());
        let dropped = Arc::new(AtomicBool::new(false));

        let router = {
            let started = Arc::clone(&started);
            let dropped = Arc::clone(&dropped);
            Router::new().route(
                "Hang",
                handler_fn(move |_ctx, _raw| {
                    let started = Arc::clone(&started);
                    let guard = DropFlag(Arc::clone(&dropped));
                    async move {
                        let _guard = guard;
                        started.notify_one();
                        std::future::pending::<Result<Value, String>>().await
                    }
                }),
            )
        };

        let alice = attach(&bus, "alice.os@chat:app:alice.os", Router::new());
        let bob = attach(&bus, "bob.os@chat:app:alice.os", router);

        alice
            .send_fire_and_forget(bob.our().clone(), encode_unit("Hang").unwrap())
            .await
            .unwrap();
        started.notified().await;
        assert!(!dropped.load(Ordering::SeqCst));

        bob.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler task was not aborted");
    }
}
