//! Correlated request/response bridge.
//!
//! [`Bridge::call`] wraps a payload in a request [`Envelope`], queues it for the host to
//! send, and remembers the request id. [`Bridge::receive`] takes every inbound envelope:
//! responses resolve the matching pending call (at most once), requests are dispatched
//! to the handler registered for their method and answered with a response envelope
//! that reuses the request id.
//!
//! Methods registered with [`Bridge::register_notification`] are one-way: the sender
//! uses [`Bridge::notify`], keeps no pending entry, and the receiver sends no response.
//!
//! Handlers get `&mut C`, an explicit context owned by the caller, instead of closing
//! over shared state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::protocol::Message;

/// Error a handler may return; reported to the caller of [`Bridge::receive`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Remote procedure handler: context, request payload, request metadata.
pub type Handler<C> =
    Box<dyn FnMut(&mut C, Option<Message>, &Envelope) -> Result<Option<Message>, HandlerError> + Send>;

struct Registered<C> {
    handler: Handler<C>,
    answer: bool,
}

struct Pending {
    method: String,
    waiter: Option<oneshot::Sender<Option<Message>>>,
}

/// Outcome of [`Bridge::receive`].
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    /// A response resolved one of our pending calls.
    Resolved {
        request_id: String,
        method: String,
        data: Option<Message>,
        elapsed: u64,
    },
    /// A request was handled and, unless it was a notification, a response queued.
    Handled { method: String },
    /// A response matched no pending call (duplicate or late) and was dropped.
    Discarded { request_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge is not attached to a data connection")]
    NotAttached,
    #[error("envelope has no request id")]
    MissingRequestId,
    #[error("no handler for method {0:?}")]
    NoHandler(String),
    #[error("handler for {method:?} failed: {source}")]
    Handler {
        method: String,
        #[source]
        source: HandlerError,
    },
    #[error("call was dropped before a response arrived")]
    Cancelled,
}

pub struct Bridge<C> {
    client_id: String,
    attached: bool,
    pending: HashMap<String, Pending>,
    handlers: HashMap<String, Registered<C>>,
    outgoing: Vec<Envelope>,
}

impl<C> Bridge<C> {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            attached: false,
            pending: HashMap::new(),
            handlers: HashMap::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Register the handler for `method`, replacing any previous one.
    pub fn register<F>(&mut self, method: &str, handler: F)
    where
        F: FnMut(&mut C, Option<Message>, &Envelope) -> Result<Option<Message>, HandlerError>
            + Send
            + 'static,
    {
        self.handlers.insert(
            method.to_owned(),
            Registered {
                handler: Box::new(handler),
                answer: true,
            },
        );
    }

    /// Register a one-way handler for `method`. Requests for it are never answered.
    pub fn register_notification<F>(&mut self, method: &str, mut handler: F)
    where
        F: FnMut(&mut C, Option<Message>, &Envelope) -> Result<(), HandlerError> + Send + 'static,
    {
        self.handlers.insert(
            method.to_owned(),
            Registered {
                handler: Box::new(
                    move |ctx: &mut C, data: Option<Message>, envelope: &Envelope| {
                        handler(ctx, data, envelope).map(|()| None)
                    },
                ),
                answer: false,
            },
        );
    }

    /// A data connection is available; calls may be issued.
    pub fn attach(&mut self) {
        self.attached = true;
    }

    /// Drop the data connection. Pending calls are abandoned (their futures resolve to
    /// [`BridgeError::Cancelled`]) and unsent envelopes are discarded.
    pub fn detach(&mut self) {
        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), "abandoning pending calls");
        }
        self.attached = false;
        self.pending.clear();
        self.outgoing.clear();
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Issue a remote call. Fails fast when no data connection is attached.
    pub fn call(
        &mut self,
        method: &str,
        data: Option<Message>,
        now: u64,
    ) -> Result<PendingCall, BridgeError> {
        if !self.attached {
            return Err(BridgeError::NotAttached);
        }
        let envelope = Envelope::request(&self.client_id, method, data, now);
        let request_id = envelope.request_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.clone(),
            Pending {
                method: method.to_owned(),
                waiter: Some(tx),
            },
        );
        self.outgoing.push(envelope);
        Ok(PendingCall { request_id, rx })
    }

    /// Issue a call for `data` without keeping its future; returns the request id. The
    /// response is still correlated and comes back from [`Bridge::receive`] as
    /// [`Dispatch::Resolved`].
    pub fn send(&mut self, data: Message, now: u64) -> Result<String, BridgeError> {
        let call = self.call(data.method(), Some(data), now)?;
        Ok(call.request_id)
    }

    /// Send a one-way request. Nothing is remembered; the peer does not answer.
    pub fn notify(&mut self, data: Message, now: u64) -> Result<(), BridgeError> {
        if !self.attached {
            return Err(BridgeError::NotAttached);
        }
        let envelope = Envelope::request(&self.client_id, data.method(), Some(data), now);
        self.outgoing.push(envelope);
        Ok(())
    }

    /// Stop waiting for `request_id`. Its response, if it still arrives, is discarded.
    pub fn forget(&mut self, request_id: &str) -> bool {
        self.pending.remove(request_id).is_some()
    }

    /// Process one inbound envelope.
    pub fn receive(
        &mut self,
        envelope: Envelope,
        ctx: &mut C,
        now: u64,
    ) -> Result<Dispatch, BridgeError> {
        if envelope.request_id.is_empty() {
            return Err(BridgeError::MissingRequestId);
        }
        if envelope.is_response() {
            return Ok(self.resolve(envelope));
        }
        let registered = self
            .handlers
            .get_mut(&envelope.method)
            .ok_or_else(|| BridgeError::NoHandler(envelope.method.clone()))?;
        let mut request = envelope;
        let data = request.data.take();
        let result =
            (registered.handler)(ctx, data, &request).map_err(|source| BridgeError::Handler {
                method: request.method.clone(),
                source,
            })?;
        let method = request.method.clone();
        if registered.answer && self.attached {
            self.outgoing.push(request.response(result, now));
        }
        Ok(Dispatch::Handled { method })
    }

    fn resolve(&mut self, envelope: Envelope) -> Dispatch {
        let Some(mut pending) = self.pending.remove(&envelope.request_id) else {
            warn!(
                request_id = %envelope.request_id,
                method = %envelope.method,
                "dropping unmatched response"
            );
            return Dispatch::Discarded {
                request_id: envelope.request_id,
            };
        };
        if let Some(waiter) = pending.waiter.take() {
            // The caller may have dropped its future; that is fine.
            let _ = waiter.send(envelope.data.clone());
        }
        Dispatch::Resolved {
            request_id: envelope.request_id,
            method: pending.method,
            data: envelope.data,
            elapsed: envelope.elapsed,
        }
    }

    /// Take queued envelopes for the host to send.
    pub fn take_outgoing(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outgoing)
    }
}

/// Handle to an issued call. Await it to get the response payload; dropping it does not
/// cancel the call.
#[derive(Debug)]
pub struct PendingCall {
    request_id: String,
    rx: oneshot::Receiver<Option<Message>>,
}

impl PendingCall {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for PendingCall {
    type Output = Result<Option<Message>, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| BridgeError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{method, AckChunk};

    #[derive(Default)]
    struct Counter {
        typing: u32,
    }

    fn bridge(id: &str) -> Bridge<Counter> {
        let mut b = Bridge::new(id);
        b.register(method::TYPING, |ctx: &mut Counter, _, _| {
            ctx.typing += 1;
            Ok(None)
        });
        b.register(method::HEARTBEAT, |_: &mut Counter, _, _| Err("boom".into()));
        b.register_notification(method::END_CALL, |ctx: &mut Counter, _, _| {
            ctx.typing = 0;
            Ok(())
        });
        b.attach();
        b
    }

    #[test]
    fn call_before_attach_fails_fast() {
        let mut b: Bridge<Counter> = Bridge::new("a");
        let err = b.call(method::TYPING, None, 0).unwrap_err();
        assert!(matches!(err, BridgeError::NotAttached));
        assert!(b.take_outgoing().is_empty());
    }

    #[test]
    fn request_is_handled_and_answered() {
        let mut a = bridge("a");
        let mut b = bridge("b");
        let mut ctx = Counter::default();
        let call = a.call(method::TYPING, Some(Message::Typing), 10).unwrap();
        let req = a.take_outgoing().pop().unwrap();
        assert_eq!(req.request_id, call.request_id());

        let d = b.receive(req.clone(), &mut ctx, 15).unwrap();
        assert_eq!(
            d,
            Dispatch::Handled {
                method: method::TYPING.into()
            }
        );
        assert_eq!(ctx.typing, 1);
        let res = b.take_outgoing().pop().unwrap();
        assert_eq!(res.request_id, req.request_id);
        assert!(res.is_response());

        let d = a.receive(res, &mut ctx, 20).unwrap();
        assert!(matches!(d, Dispatch::Resolved { ref method, .. } if method == "typing"));
        assert_eq!(a.pending_count(), 0);
    }

    #[test]
    fn duplicate_response_is_discarded() {
        let mut a = bridge("a");
        let mut b = bridge("b");
        let mut ctx = Counter::default();
        let _call = a.call(method::TYPING, None, 0).unwrap();
        let req = a.take_outgoing().pop().unwrap();
        b.receive(req, &mut ctx, 0).unwrap();
        let res = b.take_outgoing().pop().unwrap();

        assert!(matches!(
            a.receive(res.clone(), &mut ctx, 1).unwrap(),
            Dispatch::Resolved { .. }
        ));
        assert!(matches!(
            a.receive(res, &mut ctx, 2).unwrap(),
            Dispatch::Discarded { .. }
        ));
    }

    #[test]
    fn unknown_response_does_not_resolve_pending() {
        let mut a = bridge("a");
        let mut ctx = Counter::default();
        let _call = a.call(method::TYPING, None, 0).unwrap();
        let stray = Envelope::request("x", method::TYPING, None, 0).response(None, 1);
        assert!(matches!(
            a.receive(stray, &mut ctx, 1).unwrap(),
            Dispatch::Discarded { .. }
        ));
        assert_eq!(a.pending_count(), 1);
    }

    #[test]
    fn missing_handler_is_reported() {
        let mut b = bridge("b");
        let mut ctx = Counter::default();
        let req = Envelope::request("a", "nope", None, 0);
        assert!(matches!(
            b.receive(req, &mut ctx, 0),
            Err(BridgeError::NoHandler(m)) if m == "nope"
        ));
    }

    #[test]
    fn handler_error_sends_no_response() {
        let mut b = bridge("b");
        let mut ctx = Counter::default();
        let req = Envelope::request("a", method::HEARTBEAT, None, 0);
        assert!(matches!(
            b.receive(req, &mut ctx, 0),
            Err(BridgeError::Handler { .. })
        ));
        assert!(b.take_outgoing().is_empty());
    }

    #[test]
    fn empty_request_id_rejected() {
        let mut b = bridge("b");
        let mut ctx = Counter::default();
        let mut req = Envelope::request("a", method::TYPING, None, 0);
        req.request_id.clear();
        assert!(matches!(
            b.receive(req, &mut ctx, 0),
            Err(BridgeError::MissingRequestId)
        ));
    }

    #[tokio::test]
    async fn pending_call_resolves_with_response_data() {
        let mut a = bridge("a");
        let mut ctx = Counter::default();
        let call = a.call(method::FILE_CHUNK, None, 0).unwrap();
        let req = a.take_outgoing().pop().unwrap();
        let ack = Message::AckChunk(AckChunk {
            file_id: "f".into(),
            chunk_index_received: 0,
            bytes_received: 10,
        });
        a.receive(req.response(Some(ack.clone()), 5), &mut ctx, 5)
            .unwrap();
        assert_eq!(call.await.unwrap(), Some(ack));
    }

    #[tokio::test]
    async fn detach_cancels_pending_calls() {
        let mut a = bridge("a");
        let call = a.call(method::TYPING, None, 0).unwrap();
        a.detach();
        assert_eq!(a.pending_count(), 0);
        assert!(matches!(call.await, Err(BridgeError::Cancelled)));
        assert!(matches!(
            a.call(method::TYPING, None, 0),
            Err(BridgeError::NotAttached)
        ));
    }

    #[test]
    fn notification_keeps_no_pending_and_gets_no_answer() {
        let mut a = bridge("a");
        let mut b = bridge("b");
        let mut ctx = Counter { typing: 3 };
        a.notify(Message::EndCall, 0).unwrap();
        assert_eq!(a.pending_count(), 0);
        let req = a.take_outgoing().pop().unwrap();
        assert_eq!(req.method, method::END_CALL);

        let d = b.receive(req, &mut ctx, 1).unwrap();
        assert!(matches!(d, Dispatch::Handled { ref method } if method == "end-call"));
        assert_eq!(ctx.typing, 0);
        assert!(b.take_outgoing().is_empty());
    }

    #[test]
    fn notify_before_attach_fails_fast() {
        let mut a: Bridge<Counter> = Bridge::new("a");
        assert!(matches!(
            a.notify(Message::Heartbeat, 0),
            Err(BridgeError::NotAttached)
        ));
    }

    #[test]
    fn send_takes_method_from_message_and_can_be_forgotten() {
        let mut a = bridge("a");
        let mut b = bridge("b");
        let mut ctx = Counter::default();
        let id = a.send(Message::Typing, 0).unwrap();
        let req = a.take_outgoing().pop().unwrap();
        assert_eq!(req.request_id, id);
        assert_eq!(req.method, method::TYPING);
        assert_eq!(a.pending_count(), 1);

        assert!(a.forget(&id));
        assert!(!a.forget(&id));
        assert_eq!(a.pending_count(), 0);
        b.receive(req, &mut ctx, 1).unwrap();
        let res = b.take_outgoing().pop().unwrap();
        assert!(matches!(
            a.receive(res, &mut ctx, 2).unwrap(),
            Dispatch::Discarded { .. }
        ));
    }
}
