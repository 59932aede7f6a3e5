//! Hyperwire: addressed request/response messaging between nodes.
//!
//! Requests are sent to a process on a remote node, optionally expecting a
//! response under a timeout. Responses are matched back to their callers by
//! correlation id, exactly once.
//!
//! ## Architecture
//!
//! - **Correlator**: tracks in-flight requests and enforces deadlines
//! - **Transport**: hands envelopes to a channel (in-process bus or TCP)
//! - **Router**: maps a request's message-type tag to a handler
//! - **Node**: wires the three together and processes inbound frames
//! - **Envelope**: JSON wire messages, length-prefixed on stream transports

pub mod codec;
pub mod correlator;
pub mod error;
pub mod message;
pub mod node;
pub mod registry;
pub mod router;
pub mod tcp;
pub mod transport;

pub use correlator::{Correlator, ResponseHandle};
pub use error::{CodecError, RpcError, TransportError};
pub use message::{CorrelationId, Envelope, EnvelopeKind, Response};
pub use node::Node;
pub use registry::{PeerDirectory, PeerEntry, PeerState};
pub use router::{handler_fn, Handler, RequestContext, Router};
pub use tcp::TcpTransport;
pub use transport::{MemoryBus, MemoryTransport, Transport};
