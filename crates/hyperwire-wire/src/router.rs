//! Dispatch table for inbound requests.
//!
//! Handlers are registered against a message-type tag at startup. An inbound
//! request body is decoded with [`codec::decode_call`](crate::codec::decode_call)
//! and its tag selects the handler; the handler's result becomes the
//! response payload.

use crate::codec::{decode_call, encode_body};
use crate::message::{CorrelationId, Response};
use async_trait::async_trait;
use hyperwire_types::Address;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a handler knows about the request it is serving.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// This node's own address.
    pub our: Address,
    /// Who sent the request.
    pub source: Address,
    pub id: CorrelationId,
    /// `false` for fire-and-forget requests, whose result is discarded.
    pub expects_response: bool,
}

/// Serves one message-type tag.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: &RequestContext, args: Value) -> Result<Value, String>;
}

/// [`Handler`] backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Adapt an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    async fn handle(&self, ctx: &RequestContext, args: Value) -> Result<Value, String> {
        (self.f)(ctx.clone(), args).await
    }
}

/// Mapping from message-type tag to handler.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn Handler>>,
}

impl Router {
    /// An empty router: every request is answered with "no handler".
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `tag`, replacing any earlier registration.
    pub fn route(mut self, tag: impl Into<String>, handler: impl Handler) -> Self {
        let tag = tag.into();
        if self.routes.insert(tag.clone(), Arc::new(handler)).is_some() {
            warn!(tag = %tag, "Replacing previously registered handler");
        }
        self
    }

    /// Whether a handler is registered for `tag`.
    pub fn has_route(&self, tag: &str) -> bool {
        self.routes.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Run the handler selected by the request's tag.
    pub async fn dispatch(&self, ctx: &RequestContext, payload: &[u8]) -> Response {
        let (tag, args) = match decode_call(payload) {
            Ok(call) => call,
            Err(e) => {
                debug!(id = %ctx.id, source = %ctx.source, error = %e, "Undecodable request body");
                return Err(format!("malformed request body: {e}"));
            }
        };

        let Some(handler) = self.routes.get(&tag) else {
            debug!(id = %ctx.id, source = %ctx.source, tag = %tag, "No handler for tag");
            return Err(format!("no handler registered for '{tag}'"));
        };

        debug!(id = %ctx.id, source = %ctx.source, tag = %tag, "Dispatching request");
        let value = handler.handle(ctx, args).await?;
        encode_body(&value).map_err(|e| format!("failed to encode response: {e}"))
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("tags", &self.tags()).finish()
    }
}
