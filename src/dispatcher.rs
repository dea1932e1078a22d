//! One-shot invocation dispatch over an abstract transport channel.

use std::sync::Arc;

use crate::envelope::{CallEnvelope, Reply};
use crate::error::ProtocolError;
use crate::grammar::Version;
use crate::registry::TypeRegistry;
use crate::value::Value;

/// Failure of the transport layer, opaque to the protocol core.
///
/// Only [Channel] implementations construct this; the codec never
/// does. Timeouts are a transport concern and surface here as well.
#[derive(Debug, thiserror::Error)]
#[error("Transport failed: {0}")]
pub struct TransportError(pub anyhow::Error);

impl TransportError {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        TransportError(error.into())
    }

    pub fn message(message: impl std::fmt::Display) -> Self {
        TransportError(anyhow::anyhow!("{}", message))
    }
}

/// Abstract request/response transport consumed by [Dispatcher].
///
/// An implementation must treat the payload as opaque bytes and must
/// not inspect or alter it. Concrete transports (HTTP, in-process,
/// ...) live outside this crate.
#[async_trait::async_trait(?Send)]
pub trait Channel {
    async fn send(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

/// Error resolving an invocation.
///
/// A server-reported [crate::Fault] is *not* an error: it arrives as
/// [Reply::Fault], fully resolved. This type covers the two failure
/// classes that abort an invocation instead.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The reply violated the wire grammar.
    #[error("Reply violates the wire protocol")]
    Protocol(
        #[source]
        #[from]
        ProtocolError,
    ),
    /// The channel failed before a reply was received.
    #[error("Transport failed")]
    Transport(
        #[source]
        #[from]
        TransportError,
    ),
}

/// Issues calls over a [Channel].
///
/// The protocol version and type registry are static configuration;
/// every call through one dispatcher uses the same wire generation.
/// Each invocation owns its envelope and reference tables, so any
/// number may be in flight concurrently; the registry is the only
/// shared state and is read-only.
pub struct Dispatcher<C> {
    channel: C,
    version: Version,
    registry: Arc<TypeRegistry>,
}

impl<C> std::fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("version", &self.version)
            .finish()
    }
}

impl<C: Channel> Dispatcher<C> {
    pub fn new(channel: C, version: Version) -> Self {
        Self::with_registry(channel, version, Arc::new(TypeRegistry::empty()))
    }

    pub fn with_registry(channel: C, version: Version, registry: Arc<TypeRegistry>) -> Self {
        Self {
            channel,
            version,
            registry,
        }
    }

    /// Invoke `method` with `args` and resolve the reply.
    ///
    /// This is the non-blocking front-end: the returned future is the
    /// completion contract and suspends nothing until polled. Dropping
    /// it cancels the invocation; bytes already handed to the channel
    /// are not unsent, and a late reply is discarded with the dropped
    /// future.
    #[tracing::instrument(skip(self, args), fields(version = ?self.version))]
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Reply, InvokeError> {
        let mut envelope = CallEnvelope::new(self.version, method, args);
        let request = envelope.encode_call(&self.registry);
        tracing::trace!(request_len = request.len(), "sending call");
        let pending = self.channel.send(request);
        envelope.mark_sent();
        envelope.mark_awaiting();
        let response = match pending.await {
            Ok(response) => response,
            Err(error) => {
                envelope.fail_transport();
                tracing::trace!("transport failed");
                return Err(InvokeError::Transport(error));
            }
        };
        tracing::trace!(response_len = response.len(), "received reply");
        let reply = envelope.decode_reply(&response, &self.registry)?;
        match &reply {
            Reply::Success(_) => tracing::trace!("resolved"),
            Reply::Fault(fault) => tracing::trace!(code = %fault.code, "faulted"),
        }
        Ok(reply)
    }

    /// Blocking front-end over [Dispatcher::invoke]: suspends the
    /// calling thread until the channel completes.
    pub fn invoke_blocking(&self, method: &str, args: Vec<Value>) -> Result<Reply, InvokeError> {
        async_std::task::block_on(self.invoke(method, args))
    }

    /// Callback front-end over [Dispatcher::invoke]: `on_complete` is
    /// resolved exactly once, on whatever context completes the
    /// channel.
    pub async fn invoke_with<F>(&self, method: &str, args: Vec<Value>, on_complete: F)
    where
        F: FnOnce(Result<Reply, InvokeError>),
    {
        let outcome = self.invoke(method, args).await;
        on_complete(outcome);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::envelope::Fault;
    use crate::grammar::Version::{Hessian1, Hessian2};
    use std::cell::RefCell;

    /// Channel that records requests and answers with fixed bytes.
    struct StubChannel {
        requests: RefCell<Vec<Vec<u8>>>,
        response: Vec<u8>,
    }

    impl StubChannel {
        fn new(response: Vec<u8>) -> Self {
            Self {
                requests: RefCell::new(Vec::new()),
                response,
            }
        }
    }

    #[async_trait::async_trait(?Send)]
    impl Channel for StubChannel {
        async fn send(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            self.requests.borrow_mut().push(request);
            Ok(self.response.clone())
        }
    }

    struct BrokenChannel;

    #[async_trait::async_trait(?Send)]
    impl Channel for BrokenChannel {
        async fn send(&self, _request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::message("connection refused"))
        }
    }

    struct NeverChannel;

    #[async_trait::async_trait(?Send)]
    impl Channel for NeverChannel {
        async fn send(&self, _request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            futures::future::pending().await
        }
    }

    #[test]
    fn blocking_add_resolves_to_five() {
        // crafted reply frame encoding Long(5)
        let reply = vec![b'r', 0x01, 0x00, b'L', 0, 0, 0, 0, 0, 0, 0, 5, b'z'];
        let channel = StubChannel::new(reply);
        let dispatcher = Dispatcher::new(channel, Hessian1);
        let outcome = dispatcher
            .invoke_blocking("add", vec![Value::Int(2), Value::Int(3)])
            .unwrap();
        assert_eq!(outcome, Reply::Success(Value::Long(5)));

        let requests = dispatcher.channel.requests.borrow();
        assert_eq!(
            requests[0],
            vec![
                b'c', 0x01, 0x00, b'm', 0x00, 0x03, b'a', b'd', b'd', b'I', 0, 0, 0, 2,
                b'I', 0, 0, 0, 3, b'z'
            ]
        );
    }

    #[async_std::test]
    async fn fault_reply_resolves_to_fault_outcome() {
        let fault = Fault::new("ServiceException", "no such method");
        let reply = Reply::Fault(fault.clone()).encode(Hessian2, &TypeRegistry::empty());
        let dispatcher = Dispatcher::new(StubChannel::new(reply), Hessian2);
        let outcome = dispatcher.invoke("missing", vec![]).await.unwrap();
        assert_eq!(outcome, Reply::Fault(fault));
    }

    #[async_std::test]
    async fn transport_failure_is_distinct_from_fault() {
        let dispatcher = Dispatcher::new(BrokenChannel, Hessian1);
        match dispatcher.invoke("add", vec![]).await {
            Err(InvokeError::Transport(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[async_std::test]
    async fn garbage_reply_is_a_protocol_error() {
        let dispatcher = Dispatcher::new(StubChannel::new(vec![0xff, 0x00]), Hessian1);
        match dispatcher.invoke("add", vec![]).await {
            Err(InvokeError::Protocol(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[async_std::test]
    async fn callback_front_end_resolves_once() {
        let reply = Reply::Success(Value::Int(1)).encode(Hessian1, &TypeRegistry::empty());
        let dispatcher = Dispatcher::new(StubChannel::new(reply), Hessian1);
        let resolutions = RefCell::new(0);
        dispatcher
            .invoke_with("ping", vec![], |outcome| {
                *resolutions.borrow_mut() += 1;
                assert_eq!(outcome.unwrap(), Reply::Success(Value::Int(1)));
            })
            .await;
        assert_eq!(*resolutions.borrow(), 1);
    }

    #[async_std::test]
    async fn cancelled_invocation_can_be_dropped() {
        let dispatcher = Dispatcher::new(NeverChannel, Hessian1);
        let pending = dispatcher.invoke("slow", vec![]);
        futures::pin_mut!(pending);
        assert!(futures::poll!(pending.as_mut()).is_pending());
        // dropping the future is the only cancellation there is
    }

    #[async_std::test]
    async fn concurrent_invocations_do_not_share_reference_tables() {
        // both replies carry a shared pair, alias indices are private
        // to each invocation
        let make_reply = |label: &str| {
            let map = Value::map(vec![(Value::string("label"), Value::string(label))]);
            let list = Value::list(vec![map.clone(), map]);
            Reply::Success(list).encode(Hessian1, &TypeRegistry::empty())
        };
        let first = Dispatcher::new(StubChannel::new(make_reply("first")), Hessian1);
        let second = Dispatcher::new(StubChannel::new(make_reply("second")), Hessian1);

        let args = || {
            let map = Value::map(vec![(Value::Int(1), Value::Int(2))]);
            vec![map.clone(), map]
        };
        let (a, b) = futures::join!(first.invoke("echo", args()), second.invoke("echo", args()));

        let unpack = |reply: Reply| match reply {
            Reply::Success(Value::List(handle)) => {
                let list = handle.borrow();
                match (&list.elements[0], &list.elements[1]) {
                    (Value::Map(x), Value::Map(y)) => {
                        assert!(std::rc::Rc::ptr_eq(x, y));
                        match &x.borrow().entries[0].1 {
                            Value::String(label) => (**label).clone(),
                            other => panic!("unexpected {:?}", other),
                        }
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(unpack(a.unwrap()), "first");
        assert_eq!(unpack(b.unwrap()), "second");
    }
}
