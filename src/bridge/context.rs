//! Bridge Context
//!
//! One `Bridge` per channel. It owns the correlation table, the event
//! registries, the binding objects and the property mirror, and routes every
//! inbound message. Cloning is cheap and shares the same context.

use serde_json::Value;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

use super::binding::{BindingObjectRegistry, BindingState};
use super::channel::{Channel, Transport, WireMessage, excerpt};
use super::codec::decode_binary_reply;
use super::config::BridgeConfig;
use super::correlation::{Completion, CorrelationTable};
use super::dispatcher::{Continuation, Response};
use super::envelope::{Envelope, ObjectId, Target, UPDATE_PROPERTY};
use super::error::CallError;
use super::events::{Event, EventRegistry, EventTarget, dispatch_to};
use super::properties::PropertyMirror;

#[derive(Default)]
pub(crate) struct BridgeState {
    pub(crate) calls: CorrelationTable<Continuation>,
    pub(crate) objects: BindingObjectRegistry<BindingState>,
    pub(crate) registries: HashMap<Target, EventRegistry>,
    pub(crate) properties: PropertyMirror,
}

pub(crate) struct BridgeInner {
    config: BridgeConfig,
    channel: Channel,
    pub(crate) state: RefCell<BridgeState>,
    /// Nesting depth of inbound dispatch; non-zero means "inside a handler".
    dispatch_depth: Cell<usize>,
    /// Proxies dropped while the state was busy, finalized later.
    pub(crate) collected: RefCell<Vec<ObjectId>>,
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.channel.detach();
    }
}

#[derive(Clone)]
pub struct Bridge {
    inner: Rc<BridgeInner>,
}

/// Non-owning handle, held by things the bridge itself keeps alive.
#[derive(Clone)]
pub struct WeakBridge(Weak<BridgeInner>);

impl WeakBridge {
    pub fn upgrade(&self) -> Option<Bridge> {
        self.0.upgrade().map(|inner| Bridge { inner })
    }
}

struct HandlerScope<'a>(&'a Cell<usize>);

impl Drop for HandlerScope<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("name", &self.inner.config.name)
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl Bridge {
    /// Create the context for one channel and install its inbound listener.
    pub fn new(transport: Rc<dyn Transport>, config: BridgeConfig) -> Self {
        let channel = Channel::new(config.name.clone(), transport, config.log_payload_limit);
        let bridge = Bridge {
            inner: Rc::new(BridgeInner {
                config,
                channel,
                state: RefCell::new(BridgeState::default()),
                dispatch_depth: Cell::new(0),
                collected: RefCell::new(Vec::new()),
            }),
        };

        let weak = bridge.downgrade();
        bridge.inner.channel.listen_once(move || {
            Rc::new(move |message: WireMessage| match weak.upgrade() {
                Some(bridge) => bridge.handle_message(message),
                None => log::debug!("[Bridge] message after bridge was dropped"),
            })
        });
        log::info!("[Bridge {}] listening", bridge.name());
        bridge
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakBridge {
        WeakBridge(Rc::downgrade(&self.inner))
    }

    pub(crate) fn inner(&self) -> &BridgeInner {
        &self.inner
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    pub(crate) fn state(&self) -> Ref<'_, BridgeState> {
        self.inner.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, BridgeState> {
        self.inner.state.borrow_mut()
    }

    /// Whether an inbound message or event is being dispatched right now.
    pub fn in_handler(&self) -> bool {
        self.inner.dispatch_depth.get() > 0
    }

    fn enter_handler(&self) -> HandlerScope<'_> {
        let depth = &self.inner.dispatch_depth;
        depth.set(depth.get() + 1);
        HandlerScope(depth)
    }

    /// Calls still waiting for a reply, persistent continuations included.
    pub fn pending_calls(&self) -> usize {
        self.state().calls.len()
    }

    /// Event target for `target`, creating its registry with `fixed_types`
    /// as fixed slots on first use.
    pub fn event_target(&self, target: Target, fixed_types: &[&str]) -> EventTarget {
        self.event_target_with(target, || EventRegistry::new(fixed_types))
    }

    /// Event target for `target`, creating its registry with `make` on first
    /// use.
    pub fn event_target_with(
        &self,
        target: Target,
        make: impl FnOnce() -> EventRegistry,
    ) -> EventTarget {
        self.state_mut()
            .registries
            .entry(target.clone())
            .or_insert_with(make);
        EventTarget::new(self.clone(), target)
    }

    /// Run `f` on the registry of `target`, if it has one.
    pub fn with_registry<R>(
        &self,
        target: &Target,
        f: impl FnOnce(&mut EventRegistry) -> R,
    ) -> Option<R> {
        let result = {
            let mut state = self.state_mut();
            state.registries.get_mut(target).map(f)
        };
        self.flush_collected();
        result
    }

    /// Deliver an event to the listeners on `target`. Returns how many ran
    /// to completion.
    pub fn dispatch_event(&self, target: &Target, event_type: &str, data: Value) -> usize {
        let handlers = self
            .state()
            .registries
            .get(target)
            .map(|r| r.handlers_for(event_type))
            .unwrap_or_default();
        if handlers.is_empty() {
            log::debug!(
                "[Bridge {}] no listener for {} on {}",
                self.name(),
                event_type,
                target
            );
            return 0;
        }
        let event = Event {
            event_type: event_type.to_string(),
            data,
            target: target.clone(),
        };
        let _scope = self.enter_handler();
        dispatch_to(&handlers, &event)
    }

    /// Inbound entry point. Nothing here fails back into the transport:
    /// protocol errors are logged and the message dropped.
    pub fn handle_message(&self, message: WireMessage) {
        self.flush_collected();
        {
            let _scope = self.enter_handler();
            match message {
                WireMessage::Text(text) => self.route_text(&text),
                WireMessage::Binary(frame) => self.route_binary(&frame),
            }
        }
        self.flush_collected();
    }

    fn route_text(&self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!(
                    "[Bridge {}] malformed envelope dropped ({}): {}",
                    self.name(),
                    e,
                    excerpt(text, self.config().log_payload_limit)
                );
                return;
            }
        };

        let target = envelope.target();
        if let Target::Object(id) = target {
            if !self.is_object_live(id) {
                log::debug!(
                    "[Bridge {}] {} for object {} dropped, object is gone",
                    self.name(),
                    envelope.cmd,
                    id
                );
                return;
            }
        }

        if envelope.cmd == UPDATE_PROPERTY {
            self.refresh_property(&target, &envelope);
            return;
        }

        if let Some(id) = envelope.correlation_id {
            let outcome = envelope
                .outcome()
                .map(Response::Json)
                .map_err(CallError::Remote);
            self.complete_call(id, outcome);
            return;
        }

        let payload = envelope.payload();
        self.dispatch_event(&target, &envelope.cmd, payload);
    }

    fn route_binary(&self, frame: &[u8]) {
        match decode_binary_reply(frame) {
            Ok((Some(id), payload)) => {
                self.complete_call(id, Ok(Response::Binary(payload.to_vec())));
            }
            Ok((None, payload)) => log::warn!(
                "[Bridge {}] binary frame without callback id dropped ({} bytes)",
                self.name(),
                payload.len()
            ),
            Err(e) => log::warn!("[Bridge {}] bad binary frame dropped: {}", self.name(), e),
        }
    }

    /// Reject one-shot calls older than the configured timeout. Returns how
    /// many were rejected; always zero without a timeout.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let Some(timeout) = self.config().call_timeout() else {
            return 0;
        };
        let expired = self.state_mut().calls.expire(now, timeout);
        let count = expired.len();
        for (id, mut continuation) in expired {
            log::warn!("[Bridge {}] call {} timed out after {:?}", self.name(), id, timeout);
            continuation.complete(Err(CallError::TimedOut(timeout)));
        }
        self.flush_collected();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::MemoryTransport;
    use crate::bridge::dispatcher::Payload;
    use crate::bridge::error::BridgeError;
    use crate::bridge::events::Listener;
    use serde_json::json;
    use std::time::Duration;

    fn bridge_with(config: BridgeConfig) -> (Bridge, Rc<MemoryTransport>) {
        let transport = MemoryTransport::new();
        (Bridge::new(transport.clone(), config), transport)
    }

    #[test]
    fn listener_installed_once_and_removed_on_drop() {
        let (bridge, transport) = bridge_with(BridgeConfig::new("test"));
        assert_eq!(transport.listener_installs(), 1);
        drop(bridge);
        assert!(!transport.deliver_json(&json!({"cmd": "x"})));
    }

    #[test]
    fn malformed_and_unknown_messages_are_swallowed() {
        let (bridge, transport) = bridge_with(BridgeConfig::new("test"));
        assert!(transport.deliver(WireMessage::Text("{not json".into())));
        transport.deliver_json(&json!({"cmd": "r", "correlationId": 42, "data": {}}));
        transport.deliver(WireMessage::Binary(vec![1, 2]));
        transport.deliver(WireMessage::Binary(0i32.to_le_bytes().to_vec()));
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[test]
    fn events_route_to_their_target() {
        let (bridge, transport) = bridge_with(BridgeConfig::new("test"));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let ctor = bridge.event_target(Target::Constructor("Socket".into()), &["open"]);
        ctor.set_on(
            "open",
            Some(Listener::new(move |e| sink.borrow_mut().push(e.data.clone()))),
        );

        transport.deliver_json(&json!({"cmd": "open", "constructorName": "Socket", "data": 1}));
        transport.deliver_json(&json!({"cmd": "open", "data": 2}));
        transport.deliver_json(&json!({"cmd": "open", "objectId": 9, "data": 3}));
        assert_eq!(*seen.borrow(), vec![json!(1)]);
    }

    #[test]
    fn sync_call_inside_handler_is_refused() {
        let (bridge, transport) = bridge_with(BridgeConfig::new("test"));
        transport.respond_sync_with(|_| "1".to_string());
        let outcome = Rc::new(RefCell::new(None));
        let sink = outcome.clone();
        let inner = bridge.clone();
        let events = bridge.event_target(Target::Extension, &["ping"]);
        events.set_on(
            "ping",
            Some(Listener::new(move |_| {
                let result = inner.call_sync(&Target::Extension, "read", Payload::Empty);
                *sink.borrow_mut() = Some(matches!(result, Err(BridgeError::SyncInHandler(_))));
            })),
        );
        transport.deliver_json(&json!({"cmd": "ping"}));
        assert_eq!(*outcome.borrow(), Some(true));
        assert!(!bridge.in_handler());
        assert_eq!(
            bridge.call_sync(&Target::Extension, "read", Payload::Empty).unwrap(),
            Some(json!(1))
        );
    }

    #[test]
    fn sweep_rejects_only_expired_one_shot_calls() {
        let config = BridgeConfig::new("test").with_call_timeout(Duration::from_millis(100));
        let (bridge, _transport) = bridge_with(config);
        let mut call = bridge.call(&Target::Extension, "slow", Payload::Empty);
        assert_eq!(bridge.sweep_expired(Instant::now()), 0);

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(bridge.sweep_expired(later), 1);
        assert_eq!(
            call.try_result(),
            Some(Err(CallError::TimedOut(Duration::from_millis(100))))
        );
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[test]
    fn sweep_without_timeout_is_a_no_op() {
        let (bridge, _transport) = bridge_with(BridgeConfig::new("test"));
        let _call = bridge.call(&Target::Extension, "slow", Payload::Empty);
        assert_eq!(bridge.sweep_expired(Instant::now() + Duration::from_secs(3600)), 0);
        assert_eq!(bridge.pending_calls(), 1);
    }
}
