// SPDX-License-Identifier: MIT OR Apache-2.0

//! The server-side dispatch core: a handler registry keyed by
//! `(server_id, function_code)`, wildcard fallback, exception mapping, and
//! broadcast semantics, shared by the RTU ([`rtu`]) and TCP ([`tcp`]) server
//! loops.
//!
//! A [`Handler`] only ever sees one request at a time and returns either the
//! raw reply payload (everything after the function code) or an
//! [`ErrorCode`] to be framed as a standard Modbus exception. Framing,
//! transport I/O and server-id/broadcast bookkeeping are handled by the
//! dispatcher so a handler is just business logic.

pub mod bridge;
pub mod rtu;
pub mod tcp;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::error::ErrorCode;
use crate::message;

/// Wildcard key matching any function code (when used as the function-code
/// half of a registration) or any server id (when used as the server-id half).
pub const WILDCARD: u8 = 0;

/// A single incoming request as seen by a [`Handler`]: the server id the
/// request was addressed to, the function code invoked, and the payload that
/// followed it (not including the server id or function code bytes).
#[derive(Debug, Clone, Copy)]
pub struct ServerRequest<'a> {
    pub server_id: u8,
    pub function_code: u8,
    pub payload: &'a [u8],
}

/// A registered responder for one or more `(server_id, function_code)` pairs.
///
/// Implementations must not block the calling task; do I/O-bound work behind
/// an `await` rather than a synchronous blocking call. A plain closure can be
/// wrapped with [`fn_handler`] when no `await` is needed at all.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, request: ServerRequest<'_>) -> Result<Vec<u8>, ErrorCode>;
}

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(ServerRequest<'_>) -> Result<Vec<u8>, ErrorCode> + Send + Sync,
{
    async fn call(&self, request: ServerRequest<'_>) -> Result<Vec<u8>, ErrorCode> {
        (self.0)(request)
    }
}

/// Wraps a plain synchronous function as a [`Handler`].
pub fn fn_handler<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(ServerRequest<'_>) -> Result<Vec<u8>, ErrorCode> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// A [`Handler`] built from an async closure, for handlers that need to
/// `await` something (e.g. the bridge adapter in [`bridge`]).
struct AsyncFnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Handler for AsyncFnHandler<F>
where
    F: Fn(ServerRequest<'_>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, ErrorCode>> + Send,
{
    async fn call(&self, request: ServerRequest<'_>) -> Result<Vec<u8>, ErrorCode> {
        (self.0)(request).await
    }
}

pub fn async_fn_handler<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(ServerRequest<'_>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, ErrorCode>> + Send + 'static,
{
    Arc::new(AsyncFnHandler(f))
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registry mapping `(server_id, function_code)` to a [`Handler`], with
/// wildcard fallback on either half of the key.
///
/// Lookup order for an incoming `(server_id, function_code)` is: exact match,
/// then a handler registered for this `server_id` with [`WILDCARD`] function
/// code, then a handler registered for [`WILDCARD`] server id with this exact
/// function code, then a handler registered for both wildcards. The first
/// match wins.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Arc<Mutex<HashMap<(u8, u8), Arc<dyn Handler>>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handlers.lock().expect("dispatcher registry poisoned").len();
        f.debug_struct("Dispatcher").field("handlers", &count).finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `server_id`/`function_code`. Either may be
    /// [`WILDCARD`] to match any value on that half of the key. Replaces any
    /// handler previously registered for the same exact key.
    pub fn register_handler(&self, server_id: u8, function_code: u8, handler: Arc<dyn Handler>) {
        self.handlers
            .lock()
            .expect("dispatcher registry poisoned")
            .insert((server_id, function_code), handler);
    }

    /// Removes the handler registered for the exact `(server_id, function_code)` key.
    pub fn deregister_handler(&self, server_id: u8, function_code: u8) {
        self.handlers
            .lock()
            .expect("dispatcher registry poisoned")
            .remove(&(server_id, function_code));
    }

    fn lookup(&self, server_id: u8, function_code: u8) -> Option<Arc<dyn Handler>> {
        let handlers = self.handlers.lock().expect("dispatcher registry poisoned");
        handlers
            .get(&(server_id, function_code))
            .or_else(|| handlers.get(&(server_id, WILDCARD)))
            .or_else(|| handlers.get(&(WILDCARD, function_code)))
            .or_else(|| handlers.get(&(WILDCARD, WILDCARD)))
            .cloned()
    }

    /// Every registered handler whose key would match some broadcast
    /// function code request, i.e. every concrete (non-wildcard-server-id)
    /// registration plus the `(WILDCARD, WILDCARD)` catch-all. Used only for
    /// broadcast dispatch, which must reach every device this server
    /// represents rather than the single best match an ordinary request gets.
    fn broadcast_targets(&self, function_code: u8) -> Vec<Arc<dyn Handler>> {
        let handlers = self.handlers.lock().expect("dispatcher registry poisoned");
        handlers
            .iter()
            .filter(|((sid, fc), _)| *sid != WILDCARD && (*fc == function_code || *fc == WILDCARD))
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }

    /// Dispatches one already-framed request PDU (`server_id`, `function_code`,
    /// `payload`), invoking the matching handler and building the reply PDU.
    ///
    /// Returns `None` for a broadcast request (`server_id == 0`): handlers are
    /// still invoked, but per the Modbus application protocol a broadcast
    /// never produces a reply on the wire.
    pub fn dispatch<'a>(&'a self, request: ServerRequest<'a>) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            if request.server_id == message::SERVER_ID_BROADCAST {
                for handler in self.broadcast_targets(request.function_code) {
                    let _ = handler.call(request).await;
                }
                return None;
            }
            let outcome = match self.lookup(request.server_id, request.function_code) {
                Some(handler) => handler.call(request).await,
                None => Err(ErrorCode::IllegalFunction),
            };
            Some(match outcome {
                Ok(payload) => {
                    let mut pdu = Vec::with_capacity(2 + payload.len());
                    pdu.push(request.server_id);
                    pdu.push(request.function_code);
                    pdu.extend_from_slice(&payload);
                    pdu
                }
                Err(error) => {
                    message::build_exception_response(request.server_id, request.function_code, error)
                }
            })
        })
    }
}
