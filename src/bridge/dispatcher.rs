//! Call Dispatcher
//!
//! Outbound half of the bridge: builds envelopes, registers continuations in
//! the correlation table and hands back something to wait on. The inbound
//! half lives in `context.rs` and completes what is registered here.

use futures_util::FutureExt;
use serde_json::{Value, json};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use super::codec::encode_object_call;
use super::context::Bridge;
use super::correlation::{Completion, Disposition};
use super::envelope::{CorrelationId, Envelope, ObjectId, ROOT_OBJECT_ID, Target};
use super::error::{BridgeError, BridgeResult, CallError, CodecError};

/// A reply as it came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Json(Value),
    Binary(Vec<u8>),
}

/// Callback continuation. The return value decides whether it stays
/// registered for further replies.
pub struct Callback(Box<dyn FnMut(Result<Response, CallError>) -> Disposition>);

impl Callback {
    pub fn new(callback: impl FnMut(Result<Response, CallError>) -> Disposition + 'static) -> Self {
        Self(Box::new(callback))
    }

    /// Callback that only deals in JSON replies. A binary reply is reported
    /// as `CallError::UnexpectedReply`.
    pub fn json(mut callback: impl FnMut(Result<Value, CallError>) -> Disposition + 'static) -> Self {
        Self::new(move |outcome| {
            callback(outcome.and_then(|response| match response {
                Response::Json(value) => Ok(value),
                Response::Binary(_) => Err(CallError::UnexpectedReply),
            }))
        })
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

/// What the correlation table holds for the bridge.
pub(crate) enum Continuation {
    /// Backs a `Pending` future. One-shot.
    Promise(Option<oneshot::Sender<Result<Response, CallError>>>),
    Callback(Callback),
}

impl Completion for Continuation {
    type Value = Response;
    type Error = CallError;

    fn complete(&mut self, outcome: Result<Response, CallError>) -> Disposition {
        match self {
            Continuation::Promise(sender) => {
                if let Some(sender) = sender.take() {
                    if sender.send(outcome).is_err() {
                        log::debug!("[Dispatcher] reply arrived after caller stopped waiting");
                    }
                }
                Disposition::Release
            }
            Continuation::Callback(callback) => {
                match panic::catch_unwind(AssertUnwindSafe(|| (callback.0)(outcome))) {
                    Ok(disposition) => disposition,
                    Err(_) => {
                        log::error!("[Dispatcher] callback panicked, releasing it");
                        Disposition::Release
                    }
                }
            }
        }
    }
}

/// Conversion from a raw reply into the value a `Pending` resolves to.
pub trait FromResponse: Sized {
    fn from_response(response: Response) -> Result<Self, CallError>;
}

impl FromResponse for Value {
    fn from_response(response: Response) -> Result<Self, CallError> {
        match response {
            Response::Json(value) => Ok(value),
            Response::Binary(_) => Err(CallError::UnexpectedReply),
        }
    }
}

impl FromResponse for Vec<u8> {
    fn from_response(response: Response) -> Result<Self, CallError> {
        match response {
            Response::Binary(bytes) => Ok(bytes),
            Response::Json(_) => Err(CallError::UnexpectedReply),
        }
    }
}

enum PendingState {
    Waiting(oneshot::Receiver<Result<Response, CallError>>),
    Failed(Option<CallError>),
    Done,
}

/// A correlated call awaiting its reply.
///
/// Resolves once: with the native value, the native error payload, or
/// `CallError::Abandoned` if the bridge dropped the continuation.
pub struct Pending<T> {
    id: Option<CorrelationId>,
    state: PendingState,
    _kind: PhantomData<fn() -> T>,
}

/// JSON call.
pub type PendingCall = Pending<Value>;
/// Binary object call.
pub type BinaryCall = Pending<Vec<u8>>;

impl<T: FromResponse> Pending<T> {
    fn waiting(id: CorrelationId, receiver: oneshot::Receiver<Result<Response, CallError>>) -> Self {
        Self {
            id: Some(id),
            state: PendingState::Waiting(receiver),
            _kind: PhantomData,
        }
    }

    /// A call that failed before anything was sent.
    pub fn rejected(error: CallError) -> Self {
        Self {
            id: None,
            state: PendingState::Failed(Some(error)),
            _kind: PhantomData,
        }
    }

    /// Correlation id on the wire, `None` if the call never went out.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.id
    }

    /// Poll once without a runtime.
    pub fn try_result(&mut self) -> Option<Result<T, CallError>> {
        self.now_or_never()
    }
}

impl<T: FromResponse> Future for Pending<T> {
    type Output = Result<T, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            PendingState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(received) => {
                    this.state = PendingState::Done;
                    Poll::Ready(match received {
                        Ok(Ok(response)) => T::from_response(response),
                        Ok(Err(error)) => Err(error),
                        Err(_) => Err(CallError::Abandoned),
                    })
                }
            },
            PendingState::Failed(error) => {
                let error = error.take().unwrap_or(CallError::Abandoned);
                this.state = PendingState::Done;
                Poll::Ready(Err(error))
            }
            PendingState::Done => Poll::Ready(Err(CallError::Abandoned)),
        }
    }
}

/// Message body of a simple call.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Empty,
    Args(Vec<Value>),
    Data(Value),
}

impl Payload {
    fn apply(self, envelope: Envelope) -> Envelope {
        match self {
            Payload::Empty => envelope,
            Payload::Args(args) => envelope.with_args(args),
            Payload::Data(data) => envelope.with_data(data),
        }
    }
}

impl From<Vec<Value>> for Payload {
    fn from(args: Vec<Value>) -> Self {
        Payload::Args(args)
    }
}

impl From<Value> for Payload {
    fn from(data: Value) -> Self {
        Payload::Data(data)
    }
}

/// One argument of `Bridge::invoke`.
#[derive(Debug)]
pub enum Arg {
    Value(Value),
    /// Registered in the correlation table and sent as its id.
    Callback(Callback),
    /// Only valid as the payload of `Bridge::call_binary`.
    Binary(Vec<u8>),
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<Callback> for Arg {
    fn from(callback: Callback) -> Self {
        Arg::Callback(callback)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(bytes: Vec<u8>) -> Self {
        Arg::Binary(bytes)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokeOptions {
    /// Blocking round trip; the reply is returned directly.
    pub sync: bool,
    /// Correlate the call and wait for a reply.
    pub wants_reply: bool,
}

impl InvokeOptions {
    pub fn post() -> Self {
        Self::default()
    }

    pub fn call() -> Self {
        Self {
            wants_reply: true,
            ..Self::default()
        }
    }

    pub fn sync() -> Self {
        Self {
            sync: true,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub enum Invocation {
    Posted,
    Pending(PendingCall),
    Immediate(Option<Value>),
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").field("id", &self.id).finish()
    }
}

impl Bridge {
    pub(crate) fn register_continuation(
        &self,
        continuation: Continuation,
        persistent: bool,
    ) -> CorrelationId {
        self.state_mut().calls.insert(continuation, persistent)
    }

    /// Release `id` and drop whatever it held outside the state borrow.
    fn discard(&self, id: CorrelationId) {
        let continuation = self.state_mut().calls.release(id);
        drop(continuation);
    }

    /// Full-generality call. Callback arguments are registered as persistent
    /// continuations and replaced by their id.
    pub fn invoke(
        &self,
        target: &Target,
        cmd: &str,
        args: Vec<Arg>,
        options: InvokeOptions,
    ) -> BridgeResult<Invocation> {
        if options.sync && self.in_handler() {
            return Err(BridgeError::SyncInHandler(cmd.to_string()));
        }

        let mut registered = Vec::new();
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Arg::Value(value) => values.push(value),
                Arg::Callback(callback) => {
                    let id = self.register_continuation(Continuation::Callback(callback), true);
                    registered.push(id);
                    values.push(json!(id.get()));
                }
                Arg::Binary(bytes) => {
                    for id in registered {
                        self.discard(id);
                    }
                    return Err(BridgeError::InvalidArguments(format!(
                        "`{}`: binary argument ({} bytes) needs call_binary",
                        cmd,
                        bytes.len()
                    )));
                }
            }
        }

        let envelope = Envelope::new(cmd).with_args(values).addressed_to(target);
        let result = if options.sync {
            self.sync_round_trip(&envelope).map(Invocation::Immediate)
        } else if options.wants_reply {
            Ok(Invocation::Pending(self.send_correlated(envelope)))
        } else {
            self.channel().send(&envelope).map(|_| Invocation::Posted)
        };

        if result.is_err() {
            for id in registered {
                self.discard(id);
            }
        }
        result
    }

    /// Fire-and-forget.
    pub fn post(&self, target: &Target, cmd: &str, payload: Payload) -> BridgeResult<()> {
        let envelope = payload.apply(Envelope::new(cmd)).addressed_to(target);
        self.channel().send(&envelope)
    }

    /// Correlated call resolving to the native reply value.
    pub fn call(&self, target: &Target, cmd: &str, payload: Payload) -> PendingCall {
        let envelope = payload.apply(Envelope::new(cmd)).addressed_to(target);
        self.send_correlated(envelope)
    }

    fn send_correlated(&self, envelope: Envelope) -> PendingCall {
        let (sender, receiver) = oneshot::channel();
        let id = self.register_continuation(Continuation::Promise(Some(sender)), false);
        let envelope = envelope.with_correlation(id);
        if let Err(e) = self.channel().send(&envelope) {
            log::warn!("[Bridge {}] {} not sent: {}", self.name(), envelope.cmd, e);
            self.discard(id);
            return Pending::rejected(CallError::SendFailed(e.to_string()));
        }
        Pending::waiting(id, receiver)
    }

    /// Correlated call completed through `callback`. With `persistent` the
    /// continuation is exempt from the call timeout and lives until the
    /// callback releases it, native reports an error, or `remove_callback`.
    pub fn call_with_callback(
        &self,
        target: &Target,
        cmd: &str,
        payload: Payload,
        callback: Callback,
        persistent: bool,
    ) -> BridgeResult<CorrelationId> {
        let id = self.register_continuation(Continuation::Callback(callback), persistent);
        let envelope = payload
            .apply(Envelope::new(cmd))
            .addressed_to(target)
            .with_correlation(id);
        if let Err(e) = self.channel().send(&envelope) {
            self.discard(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Blocking round trip. Refused while an inbound message is being
    /// dispatched.
    pub fn call_sync(&self, target: &Target, cmd: &str, payload: Payload) -> BridgeResult<Option<Value>> {
        let envelope = payload.apply(Envelope::new(cmd)).addressed_to(target);
        self.sync_round_trip(&envelope)
    }

    pub(crate) fn sync_round_trip(&self, envelope: &Envelope) -> BridgeResult<Option<Value>> {
        if self.in_handler() {
            log::warn!(
                "[Bridge {}] sync call {} refused inside a handler",
                self.name(),
                envelope.cmd
            );
            return Err(BridgeError::SyncInHandler(envelope.cmd.clone()));
        }
        self.channel().send_sync(envelope)
    }

    /// Binary object call. Anything but a binary payload addressed to a live
    /// binding object is rejected before it is sent.
    pub fn call_binary(&self, object_id: ObjectId, method: &str, payload: impl Into<Arg>) -> BinaryCall {
        let bytes = match payload.into() {
            Arg::Binary(bytes) => bytes,
            _ => {
                return Pending::rejected(CallError::InvalidArguments(format!(
                    "`{}`: {}",
                    method,
                    CodecError::NonBinaryPayload
                )));
            }
        };
        if object_id == ROOT_OBJECT_ID || !self.is_object_live(object_id) {
            return Pending::rejected(CallError::InvalidArguments(format!(
                "`{}` needs a live binding object, got id {}",
                method, object_id
            )));
        }

        let (sender, receiver) = oneshot::channel();
        let id = self.register_continuation(Continuation::Promise(Some(sender)), false);
        let frame = match encode_object_call(Some(id), object_id, method, &bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.discard(id);
                return Pending::rejected(CallError::InvalidArguments(e.to_string()));
            }
        };
        if let Err(e) = self.channel().send_binary(frame) {
            self.discard(id);
            return Pending::rejected(CallError::SendFailed(e.to_string()));
        }
        Pending::waiting(id, receiver)
    }

    /// Drop a registered continuation without invoking it. Returns whether
    /// `id` was pending.
    pub fn remove_callback(&self, id: CorrelationId) -> bool {
        let (was_pending, continuation) = {
            let mut state = self.state_mut();
            let was_pending = state.calls.is_pending(id);
            (was_pending, state.calls.release(id))
        };
        drop(continuation);
        was_pending
    }

    /// Complete the continuation registered under `id`. A failure always
    /// releases it. No state borrow is held while it runs.
    pub(crate) fn complete_call(&self, id: CorrelationId, outcome: Result<Response, CallError>) -> bool {
        let checked_out = self.state_mut().calls.checkout(id);
        let Some(mut continuation) = checked_out else {
            log::debug!("[Bridge {}] reply for unknown correlation id {} ignored", self.name(), id);
            return false;
        };
        let failed = outcome.is_err();
        let disposition = continuation.complete(outcome);
        let disposition = if failed { Disposition::Release } else { disposition };
        // The callback may have freed its own id and a new call taken it.
        let stale = {
            let mut state = self.state_mut();
            state.calls.checkin(id, continuation, disposition)
        };
        drop(stale);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::MemoryTransport;
    use crate::bridge::config::BridgeConfig;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn bridge() -> (Bridge, Rc<MemoryTransport>) {
        let transport = MemoryTransport::new();
        let bridge = Bridge::new(transport.clone(), BridgeConfig::new("test"));
        (bridge, transport)
    }

    #[test]
    fn call_resolves_with_reply_body() {
        let (bridge, transport) = bridge();
        let mut call = bridge.call(&Target::Extension, "getCPUInfo", Payload::Empty);
        let sent = transport.take_envelopes();
        assert_eq!(sent[0].correlation_id, call.correlation_id());
        assert!(call.try_result().is_none());

        transport.deliver_json(&json!({
            "cmd": "getCPUInfo_ret",
            "correlationId": call.correlation_id().unwrap().get(),
            "data": {"body": {"load": 0.5}, "error": null},
        }));
        assert_eq!(call.try_result(), Some(Ok(json!({"load": 0.5}))));
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[test]
    fn remote_error_rejects_with_payload() {
        let (bridge, transport) = bridge();
        let mut call = bridge.call(&Target::Extension, "msg_smsSend", json!({"phone": "x"}).into());
        let id = call.correlation_id().unwrap().get();
        transport.deliver_json(&json!({"cmd": "r", "correlationId": id, "data": {"error": "bad number"}}));
        assert_eq!(call.try_result(), Some(Err(CallError::Remote(json!("bad number")))));
    }

    #[test]
    fn send_failure_rejects_and_frees_id() {
        let (bridge, transport) = bridge();
        transport.close();
        let mut call = bridge.call(&Target::Extension, "x", Payload::Empty);
        assert!(matches!(call.try_result(), Some(Err(CallError::SendFailed(_)))));
        assert_eq!(call.correlation_id(), None);
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[test]
    fn callback_arguments_are_sent_as_ids() {
        let (bridge, transport) = bridge();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let callback = Callback::json(move |outcome| {
            sink.borrow_mut().push(outcome);
            Disposition::Keep
        });
        let invocation = bridge
            .invoke(
                &Target::Extension,
                "watch",
                vec![json!("battery").into(), callback.into()],
                InvokeOptions::post(),
            )
            .unwrap();
        assert!(matches!(invocation, Invocation::Posted));

        let sent = transport.take_envelopes();
        let id = sent[0].args[1].as_u64().unwrap();
        for level in [80, 79] {
            transport.deliver_json(&json!({"cmd": "watch", "correlationId": id, "data": level}));
        }
        assert_eq!(*seen.borrow(), vec![Ok(json!(80)), Ok(json!(79))]);
        assert!(bridge.remove_callback(CorrelationId(id as u32)));
        assert!(!bridge.remove_callback(CorrelationId(id as u32)));
    }

    #[test]
    fn invoke_rejects_binary_arguments_and_frees_callbacks() {
        let (bridge, transport) = bridge();
        let result = bridge.invoke(
            &Target::Extension,
            "x",
            vec![Callback::json(|_| Disposition::Release).into(), vec![1u8, 2].into()],
            InvokeOptions::call(),
        );
        assert!(matches!(result, Err(BridgeError::InvalidArguments(_))));
        assert_eq!(bridge.pending_calls(), 0);
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn binary_call_fails_fast_without_sending() {
        let (bridge, transport) = bridge();
        let mut not_binary = bridge.call_binary(3, "send", json!("text"));
        match not_binary.try_result() {
            Some(Err(CallError::InvalidArguments(message))) => {
                assert!(message.contains(&CodecError::NonBinaryPayload.to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
        let mut root = bridge.call_binary(ROOT_OBJECT_ID, "send", vec![1u8]);
        assert!(matches!(root.try_result(), Some(Err(CallError::InvalidArguments(_)))));
        assert!(transport.take_sent().is_empty());
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[test]
    fn sync_call_returns_reply_directly() {
        let (bridge, transport) = bridge();
        transport.respond_sync_with(|_| "[0,1]".to_string());
        let value = bridge
            .call_sync(&Target::Extension, "msg_smsServiceId", Payload::Empty)
            .unwrap();
        assert_eq!(value, Some(json!([0, 1])));
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[test]
    fn dropped_bridge_abandons_pending_calls() {
        let (bridge, _transport) = bridge();
        let mut call = bridge.call(&Target::Extension, "x", Payload::Empty);
        drop(bridge);
        assert_eq!(call.try_result(), Some(Err(CallError::Abandoned)));
    }

    #[test]
    fn invoke_call_resolves_through_pending() {
        let (bridge, transport) = bridge();
        let invocation = bridge
            .invoke(
                &Target::Extension,
                "getMemoryInfo",
                vec![json!("physical").into()],
                InvokeOptions::call(),
            )
            .unwrap();
        let Invocation::Pending(mut call) = invocation else {
            panic!("expected a pending call, got {:?}", invocation);
        };
        let sent = transport.take_envelopes();
        assert_eq!(sent[0].args, vec![json!("physical")]);
        assert_eq!(sent[0].correlation_id, call.correlation_id());

        transport.deliver_json(&json!({
            "cmd": "getMemoryInfo_ret",
            "correlationId": call.correlation_id().unwrap().get(),
            "data": {"body": {"capacity": 4096}, "error": null},
        }));
        assert_eq!(call.try_result(), Some(Ok(json!({"capacity": 4096}))));
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[test]
    fn invoke_sync_returns_immediately() {
        let (bridge, transport) = bridge();
        transport.respond_sync_with(|_| r#"{"volume":3}"#.to_string());
        let invocation = bridge
            .invoke(
                &Target::Object(2),
                "getSettings",
                vec![json!("audio").into()],
                InvokeOptions::sync(),
            )
            .unwrap();
        assert!(matches!(
            invocation,
            Invocation::Immediate(Some(ref value)) if *value == json!({"volume": 3})
        ));
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[test]
    fn callback_that_frees_its_id_does_not_cancel_the_next_call() {
        let (bridge, transport) = bridge();
        let own_id = Rc::new(Cell::new(None));
        let next_call = Rc::new(RefCell::new(None));

        let handle = bridge.clone();
        let id_slot = own_id.clone();
        let next_slot = next_call.clone();
        let callback = Callback::json(move |_| {
            if let Some(id) = id_slot.get() {
                handle.remove_callback(id);
            }
            *next_slot.borrow_mut() = Some(handle.call(&Target::Extension, "second", Payload::Empty));
            Disposition::Release
        });
        let first = bridge
            .call_with_callback(&Target::Extension, "first", Payload::Empty, callback, false)
            .unwrap();
        own_id.set(Some(first));

        transport.deliver_json(&json!({"cmd": "first_ret", "correlationId": first.get(), "data": {"body": 1}}));

        let mut second = next_call.borrow_mut().take().unwrap();
        assert_eq!(second.correlation_id(), Some(first));
        assert_eq!(bridge.pending_calls(), 1);
        assert!(second.try_result().is_none());

        transport.deliver_json(&json!({"cmd": "second_ret", "correlationId": first.get(), "data": {"body": 2}}));
        assert_eq!(second.try_result(), Some(Ok(json!(2))));
        assert_eq!(bridge.pending_calls(), 0);
    }
}
