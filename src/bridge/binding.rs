//! Binding Objects
//!
//! Client-side proxies for native-held instances (a socket, a device
//! handle). Each proxy owns an id > 0; native is told when the proxy goes
//! away, either through `BindingObject::destroy` or when the last handle is
//! dropped.

use serde_json::{Value, json};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use super::context::{Bridge, WeakBridge};
use super::correlation::IdAllocator;
use super::dispatcher::{Arg, BinaryCall, Callback, Pending, PendingCall, Payload};
use super::envelope::{CorrelationId, Envelope, ObjectId, Target};
use super::error::{BridgeError, BridgeResult, CallError};
use super::events::{EventRegistry, EventTarget};

/// Constructor-style creation notification.
pub const NEW_INSTANCE: &str = "newInstance";
/// Destroy notification.
pub const OBJECT_COLLECTED: &str = "JSObjectCollected";

/// Id to proxy association. Holds proxies weakly so it never keeps one
/// alive.
pub struct BindingObjectRegistry<T> {
    ids: IdAllocator,
    objects: HashMap<ObjectId, Weak<T>>,
}

impl<T> Default for BindingObjectRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BindingObjectRegistry<T> {
    pub fn new() -> Self {
        Self {
            ids: IdAllocator::starting_at(1),
            objects: HashMap::new(),
        }
    }

    /// Allocate the smallest free id and associate the proxy `make` builds
    /// for it.
    pub fn create(&mut self, make: impl FnOnce(ObjectId) -> Rc<T>) -> Rc<T> {
        let id = self.ids.allocate();
        let proxy = make(id);
        self.objects.insert(id, Rc::downgrade(&proxy));
        proxy
    }

    /// Free `id` for reuse. Returns `false` if it was already destroyed.
    pub fn destroy(&mut self, id: ObjectId) -> bool {
        if self.objects.remove(&id).is_none() {
            return false;
        }
        self.ids.release(id);
        true
    }

    /// The proxy for `id`, or `None` if it was destroyed or dropped.
    pub fn lookup(&self, id: ObjectId) -> Option<Rc<T>> {
        self.objects.get(&id)?.upgrade()
    }

    /// Associated and still referenced. Does not create a strong handle.
    pub fn is_live(&self, id: ObjectId) -> bool {
        self.objects.get(&id).is_some_and(|w| w.strong_count() > 0)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

pub(crate) struct BindingState {
    id: ObjectId,
    constructor: String,
    bridge: WeakBridge,
    released: Cell<bool>,
}

impl Drop for BindingState {
    fn drop(&mut self) {
        if self.released.get() {
            return;
        }
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.object_collected(self.id);
        }
    }
}

/// Handle to a binding object. Clones share the object; native is notified
/// once the last clone is dropped unless `destroy` ran first.
#[derive(Clone)]
pub struct BindingObject {
    state: Rc<BindingState>,
}

impl fmt::Debug for BindingObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingObject")
            .field("id", &self.state.id)
            .field("constructor", &self.state.constructor)
            .field("destroyed", &self.state.released.get())
            .finish()
    }
}

impl BindingObject {
    pub fn id(&self) -> ObjectId {
        self.state.id
    }

    pub fn constructor_name(&self) -> &str {
        &self.state.constructor
    }

    pub fn target(&self) -> Target {
        Target::Object(self.state.id)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.released.get()
    }

    fn bridge(&self) -> BridgeResult<Bridge> {
        if self.is_destroyed() {
            return Err(BridgeError::UnknownObject(self.id()));
        }
        self.state.bridge.upgrade().ok_or(BridgeError::Detached)
    }

    pub fn call(&self, cmd: &str, payload: Payload) -> PendingCall {
        match self.bridge() {
            Ok(bridge) => bridge.call(&self.target(), cmd, payload),
            Err(e) => Pending::rejected(CallError::SendFailed(e.to_string())),
        }
    }

    pub fn post(&self, cmd: &str, payload: Payload) -> BridgeResult<()> {
        self.bridge()?.post(&self.target(), cmd, payload)
    }

    pub fn call_with_callback(
        &self,
        cmd: &str,
        payload: Payload,
        callback: Callback,
        persistent: bool,
    ) -> BridgeResult<CorrelationId> {
        self.bridge()?
            .call_with_callback(&self.target(), cmd, payload, callback, persistent)
    }

    pub fn call_sync(&self, cmd: &str, payload: Payload) -> BridgeResult<Option<Value>> {
        self.bridge()?.call_sync(&self.target(), cmd, payload)
    }

    pub fn call_binary(&self, method: &str, payload: impl Into<Arg>) -> BinaryCall {
        match self.bridge() {
            Ok(bridge) => bridge.call_binary(self.id(), method, payload),
            Err(e) => Pending::rejected(CallError::SendFailed(e.to_string())),
        }
    }

    /// This object's event target, with `fixed_types` as its fixed slots.
    pub fn events(&self, fixed_types: &[&str]) -> BridgeResult<EventTarget> {
        let bridge = self.bridge()?;
        Ok(bridge.event_target(self.target(), fixed_types))
    }

    /// Like `events`, but dynamic listeners are limited to the declared
    /// types.
    pub fn declared_events(&self, types: &[&str]) -> BridgeResult<EventTarget> {
        let bridge = self.bridge()?;
        Ok(bridge.event_target_with(self.target(), || {
            EventRegistry::new(types).restrict_to_declared()
        }))
    }

    /// Notify native and free the id. Idempotent; returns whether this call
    /// did the destroying.
    pub fn destroy(&self) -> bool {
        if self.state.released.replace(true) {
            return false;
        }
        match self.state.bridge.upgrade() {
            Some(bridge) => bridge.release_object(self.id(), "destroyed"),
            None => false,
        }
    }
}

impl Bridge {
    /// Create a binding object: allocate its id and tell native to construct
    /// the counterpart.
    pub fn create_object(&self, constructor: &str, args: Vec<Value>) -> BridgeResult<BindingObject> {
        self.flush_collected();
        let weak = self.downgrade();
        let state = self.state_mut().objects.create(|id| {
            Rc::new(BindingState {
                id,
                constructor: constructor.to_string(),
                bridge: weak,
                released: Cell::new(false),
            })
        });
        let id = state.id;

        let envelope = Envelope::new(NEW_INSTANCE)
            .with_name(constructor)
            .with_args(vec![json!(id), Value::Array(args)]);
        if let Err(e) = self.channel().send(&envelope) {
            log::warn!("[Bridge {}] failed to create {}: {}", self.name(), constructor, e);
            state.released.set(true);
            self.state_mut().objects.destroy(id);
            return Err(e);
        }
        log::debug!("[Bridge {}] created {} object {}", self.name(), constructor, id);
        Ok(BindingObject { state })
    }

    /// Destroy by id. Idempotent.
    pub fn destroy_object(&self, id: ObjectId) -> bool {
        let proxy = self.state().objects.lookup(id);
        match proxy {
            Some(state) => BindingObject { state }.destroy(),
            None => self.release_object(id, "destroyed"),
        }
    }

    pub fn is_object_live(&self, id: ObjectId) -> bool {
        self.state().objects.is_live(id)
    }

    pub fn live_objects(&self) -> usize {
        self.state().objects.len()
    }

    /// Queue the finalization of a dropped proxy. Runs right away unless the
    /// bridge state is busy.
    pub(crate) fn object_collected(&self, id: ObjectId) {
        self.inner().collected.borrow_mut().push(id);
        self.flush_collected();
    }

    pub(crate) fn flush_collected(&self) {
        loop {
            if self.inner().state.try_borrow_mut().is_err() {
                return;
            }
            let next = self.inner().collected.borrow_mut().pop();
            let Some(id) = next else {
                return;
            };
            self.release_object(id, "collected");
        }
    }

    /// Drop the association, event registry and property mirror of `id`,
    /// then tell native. No-op for an id that is already gone.
    pub(crate) fn release_object(&self, id: ObjectId, how: &str) -> bool {
        let target = Target::Object(id);
        let (removed, registry) = {
            let mut state = self.state_mut();
            let removed = state.objects.destroy(id);
            let registry = state.registries.remove(&target);
            state.properties.forget_target(&target);
            (removed, registry)
        };
        if !removed {
            return false;
        }
        if let Some(registry) = registry {
            for (_, correlation) in registry.subscriptions() {
                self.remove_callback(correlation);
            }
            drop(registry);
        }

        let envelope = Envelope::new(OBJECT_COLLECTED).with_args(vec![json!(id)]);
        if let Err(e) = self.channel().send(&envelope) {
            log::warn!("[Bridge {}] object {} {} but native not told: {}", self.name(), id, how, e);
        } else {
            log::debug!("[Bridge {}] object {} {}", self.name(), id, how);
        }
        true
    }
}
