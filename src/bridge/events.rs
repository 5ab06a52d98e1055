//! Event Registry
//!
//! Per-target listener table. A small set of well-known event types own a
//! fixed slot each (single handler, `on<type>` semantics); everything added
//! through `add_event_listener` gets its own dynamic slot. The first
//! listener for a type subscribes on the native side and removing the last
//! one unsubscribes, unless the registry is local-only.

use serde_json::{Value, json};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use super::context::Bridge;
use super::correlation::Disposition;
use super::dispatcher::{Callback, Payload, Response};
use super::envelope::{CorrelationId, Target};

/// Index into a target's listener table. Fixed slots come first.
pub type SlotId = usize;

pub const ADD_EVENT_LISTENER: &str = "addEventListener";
pub const REMOVE_EVENT_LISTENER: &str = "removeEventListener";

/// An event delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub data: Value,
    pub target: Target,
}

/// An event handler. Identity is the allocation: clones of one `Listener`
/// are the same listener, two `Listener::new` calls never are.
#[derive(Clone)]
pub struct Listener(Rc<dyn Fn(&Event)>);

impl Listener {
    pub fn new(handler: impl Fn(&Event) + 'static) -> Self {
        Self(Rc::new(handler))
    }

    pub fn call(&self, event: &Event) {
        (self.0)(event)
    }

    pub fn same(&self, other: &Listener) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.0), Rc::as_ptr(&other.0))
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({:p})", Rc::as_ptr(&self.0))
    }
}

/// Invoke `handlers` in order. A panicking handler is logged and does not
/// stop the ones after it. Returns how many completed normally.
pub fn dispatch_to(handlers: &[Listener], event: &Event) -> usize {
    let mut completed = 0;
    for handler in handlers {
        match panic::catch_unwind(AssertUnwindSafe(|| handler.call(event))) {
            Ok(()) => completed += 1,
            Err(e) => {
                let reason = e
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| e.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!(
                    "[Events] {} listener for {} failed: {}",
                    event.event_type,
                    event.target,
                    reason
                );
            }
        }
    }
    completed
}

#[derive(Debug)]
struct FixedSlot {
    event_type: String,
    handler: Option<Listener>,
}

/// Result of a dynamic subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscribed {
    pub slot: SlotId,
    /// No dynamic listener existed for the type before this one.
    pub first_for_type: bool,
}

#[derive(Debug, Default)]
pub struct EventRegistry {
    fixed: Vec<FixedSlot>,
    dynamic: BTreeMap<SlotId, (String, Listener)>,
    next_slot: SlotId,
    /// Native subscription (persistent continuation) per event type.
    subscriptions: HashMap<String, CorrelationId>,
    /// When set, only these types may be subscribed dynamically.
    declared: Option<HashSet<String>>,
    /// Listeners never subscribe on the native side.
    local_only: bool,
}

impl EventRegistry {
    /// Registry with one fixed slot per entry of `fixed_types`, in order.
    pub fn new(fixed_types: &[&str]) -> Self {
        let fixed: Vec<FixedSlot> = fixed_types
            .iter()
            .map(|t| FixedSlot {
                event_type: t.to_string(),
                handler: None,
            })
            .collect();
        Self {
            next_slot: fixed.len(),
            fixed,
            ..Default::default()
        }
    }

    /// Only accept dynamic listeners for the fixed (declared) types.
    pub fn restrict_to_declared(mut self) -> Self {
        self.declared = Some(self.fixed.iter().map(|s| s.event_type.clone()).collect());
        self
    }

    /// Native pushes these events unasked; listeners stay client-side.
    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    pub fn notifies_native(&self) -> bool {
        !self.local_only
    }

    /// A native subscription is wanted for `event_type` but not held.
    pub fn needs_subscription(&self, event_type: &str) -> bool {
        self.notifies_native()
            && self.subscriber_count(event_type) > 0
            && !self.subscriptions.contains_key(event_type)
    }

    /// A native subscription is held for `event_type` but nobody listens.
    pub fn stale_subscription(&self, event_type: &str) -> bool {
        self.subscriptions.contains_key(event_type) && self.subscriber_count(event_type) == 0
    }

    pub fn fixed_slot(&self, event_type: &str) -> Option<SlotId> {
        self.fixed.iter().position(|s| s.event_type == event_type)
    }

    pub fn fixed_types(&self) -> impl Iterator<Item = &str> {
        self.fixed.iter().map(|s| s.event_type.as_str())
    }

    /// Overwrite the fixed slot for `event_type`; `None` clears it. Returns
    /// the slot and the previous handler, or `None` if the type has no slot.
    pub fn set_fixed(
        &mut self,
        event_type: &str,
        handler: Option<Listener>,
    ) -> Option<(SlotId, Option<Listener>)> {
        let slot = self.fixed_slot(event_type)?;
        let previous = std::mem::replace(&mut self.fixed[slot].handler, handler);
        Some((slot, previous))
    }

    pub fn fixed_handler(&self, event_type: &str) -> Option<Listener> {
        let slot = self.fixed_slot(event_type)?;
        self.fixed[slot].handler.clone()
    }

    /// Add a dynamic listener. Re-adding the same `(type, listener)` pair is a
    /// no-op that reports the existing slot. `None` for a usage error.
    pub fn subscribe(&mut self, event_type: &str, listener: &Listener) -> Option<Subscribed> {
        if event_type.is_empty() {
            log::warn!("[Events] refusing listener for empty event type");
            return None;
        }
        if let Some(declared) = &self.declared {
            if !declared.contains(event_type) {
                log::warn!("[Events] invalid or unsupported event type: {}", event_type);
                return None;
            }
        }
        let mut first_for_type = true;
        for (slot, (t, l)) in &self.dynamic {
            if t == event_type {
                if l.same(listener) {
                    return Some(Subscribed {
                        slot: *slot,
                        first_for_type: false,
                    });
                }
                first_for_type = false;
            }
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.dynamic
            .insert(slot, (event_type.to_string(), listener.clone()));
        Some(Subscribed {
            slot,
            first_for_type,
        })
    }

    /// Remove the dynamic slot holding `(event_type, listener)`. Returns
    /// `Some(last_for_type)` when something was removed.
    pub fn unsubscribe(&mut self, event_type: &str, listener: &Listener) -> Option<bool> {
        let slot = self
            .dynamic
            .iter()
            .find(|(_, (t, l))| t == event_type && l.same(listener))
            .map(|(slot, _)| *slot)?;
        self.dynamic.remove(&slot);
        Some(self.dynamic_count(event_type) == 0)
    }

    /// Remove by slot. Fixed slots are cleared; dynamic slots report their
    /// type and whether it was the last one.
    pub fn unsubscribe_slot(&mut self, slot: SlotId) -> Option<(String, bool)> {
        if let Some(fixed) = self.fixed.get_mut(slot) {
            fixed.handler.take()?;
            return Some((fixed.event_type.clone(), false));
        }
        let (event_type, _) = self.dynamic.remove(&slot)?;
        let last = self.dynamic_count(&event_type) == 0;
        Some((event_type, last))
    }

    /// Handlers for `event_type`: the fixed slot first, then dynamic slots in
    /// insertion order.
    pub fn handlers_for(&self, event_type: &str) -> Vec<Listener> {
        let fixed = self
            .fixed
            .iter()
            .filter(|s| s.event_type == event_type)
            .filter_map(|s| s.handler.clone());
        let dynamic = self
            .dynamic
            .values()
            .filter(|(t, _)| t == event_type)
            .map(|(_, l)| l.clone());
        fixed.chain(dynamic).collect()
    }

    pub fn dynamic_count(&self, event_type: &str) -> usize {
        self.dynamic.values().filter(|(t, _)| t == event_type).count()
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.handlers_for(event_type).len()
    }

    pub fn bind_subscription(&mut self, event_type: &str, id: CorrelationId) {
        self.subscriptions.insert(event_type.to_string(), id);
    }

    pub fn subscription(&self, event_type: &str) -> Option<CorrelationId> {
        self.subscriptions.get(event_type).copied()
    }

    pub fn take_subscription(&mut self, event_type: &str) -> Option<CorrelationId> {
        self.subscriptions.remove(event_type)
    }

    /// Forget a subscription only if it is still bound to `id`.
    pub fn forget_subscription(&mut self, event_type: &str, id: CorrelationId) -> bool {
        if self.subscriptions.get(event_type) == Some(&id) {
            self.subscriptions.remove(event_type);
            return true;
        }
        false
    }

    /// Every native subscription still held.
    pub fn subscriptions(&self) -> Vec<(String, CorrelationId)> {
        self.subscriptions
            .iter()
            .map(|(t, id)| (t.clone(), *id))
            .collect()
    }

    /// Dispatch directly from the registry.
    pub fn dispatch(&self, target: &Target, event_type: &str, data: Value) -> usize {
        let event = Event {
            event_type: event_type.to_string(),
            data,
            target: target.clone(),
        };
        dispatch_to(&self.handlers_for(event_type), &event)
    }
}

/// Event API of one target, backed by the bridge's registry for it.
#[derive(Clone)]
pub struct EventTarget {
    bridge: Bridge,
    target: Target,
}

impl EventTarget {
    pub(crate) fn new(bridge: Bridge, target: Target) -> Self {
        Self { bridge, target }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// `on<type>` setter. Overwrites the fixed slot; `None` clears it.
    /// Returns `false` if `event_type` has no fixed slot.
    pub fn set_on(&self, event_type: &str, handler: Option<Listener>) -> bool {
        let replaced = self
            .bridge
            .with_registry(&self.target, |r| r.set_fixed(event_type, handler))
            .flatten();
        let Some((_, previous)) = replaced else {
            log::warn!("[Events] invalid event name: on{}", event_type);
            return false;
        };
        drop(previous);
        self.sync_native(event_type);
        true
    }

    /// `on<type>` getter.
    pub fn on(&self, event_type: &str) -> Option<Listener> {
        self.bridge
            .with_registry(&self.target, |r| r.fixed_handler(event_type))
            .flatten()
    }

    /// Add a dynamic listener. Returns its slot, or `None` for a usage error.
    pub fn add_event_listener(&self, event_type: &str, listener: &Listener) -> Option<SlotId> {
        let subscribed = self
            .bridge
            .with_registry(&self.target, |r| r.subscribe(event_type, listener))
            .flatten()?;
        self.sync_native(event_type);
        Some(subscribed.slot)
    }

    /// Remove a dynamic listener. Returns whether one was removed.
    pub fn remove_event_listener(&self, event_type: &str, listener: &Listener) -> bool {
        let removed = self
            .bridge
            .with_registry(&self.target, |r| r.unsubscribe(event_type, listener))
            .flatten()
            .is_some();
        if !removed {
            log::debug!(
                "[Events] no {} listener to remove on {}",
                event_type,
                self.target
            );
            return false;
        }
        self.sync_native(event_type);
        true
    }

    /// Remove whatever occupies `slot`.
    pub fn remove_listener(&self, slot: SlotId) -> bool {
        let removed = self
            .bridge
            .with_registry(&self.target, |r| r.unsubscribe_slot(slot))
            .flatten();
        match removed {
            Some((event_type, _)) => {
                self.sync_native(&event_type);
                true
            }
            None => false,
        }
    }

    /// Dispatch locally to the current listeners, without involving native.
    pub fn dispatch_event(&self, event_type: &str, data: Value) -> usize {
        self.bridge.dispatch_event(&self.target, event_type, data)
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.bridge
            .with_registry(&self.target, |r| r.subscriber_count(event_type))
            .unwrap_or(0)
    }

    /// Subscribe on the native side when the first listener for a type
    /// appears, unsubscribe when the last one goes.
    fn sync_native(&self, event_type: &str) {
        let (subscribe, unsubscribe) = self
            .bridge
            .with_registry(&self.target, |r| {
                (r.needs_subscription(event_type), r.stale_subscription(event_type))
            })
            .unwrap_or((false, false));
        if subscribe {
            self.subscribe_native(event_type);
        } else if unsubscribe {
            self.unsubscribe_native(event_type);
        }
    }

    fn subscribe_native(&self, event_type: &str) {
        let weak = self.bridge.downgrade();
        let target = self.target.clone();
        let owned_type = event_type.to_string();
        let bound: Rc<Cell<Option<CorrelationId>>> = Rc::new(Cell::new(None));
        let own_id = bound.clone();
        let callback = Callback::new(move |outcome| {
            let Some(bridge) = weak.upgrade() else {
                return Disposition::Release;
            };
            match outcome {
                Ok(Response::Json(data)) => {
                    bridge.dispatch_event(&target, &owned_type, data);
                }
                Ok(Response::Binary(bytes)) => {
                    log::warn!(
                        "[Events] binary payload ({} bytes) on {} subscription ignored",
                        bytes.len(),
                        owned_type
                    );
                }
                Err(e) => {
                    log::warn!("[Events] native dropped {} subscription: {}", owned_type, e);
                    if let Some(id) = own_id.get() {
                        bridge.with_registry(&target, |r| r.forget_subscription(&owned_type, id));
                    }
                }
            }
            Disposition::Keep
        });

        let payload = Payload::Args(vec![json!(event_type)]);
        match self.bridge.call_with_callback(
            &self.target,
            ADD_EVENT_LISTENER,
            payload,
            callback,
            true,
        ) {
            Ok(id) => {
                bound.set(Some(id));
                self.bridge
                    .with_registry(&self.target, |r| r.bind_subscription(event_type, id));
            }
            Err(e) => log::warn!(
                "[Events] failed to subscribe {} on {}: {}",
                event_type,
                self.target,
                e
            ),
        }
    }

    fn unsubscribe_native(&self, event_type: &str) {
        let id = self
            .bridge
            .with_registry(&self.target, |r| r.take_subscription(event_type))
            .flatten();
        let Some(id) = id else {
            return;
        };
        self.bridge.remove_callback(id);
        let payload = Payload::Args(vec![json!(event_type)]);
        if let Err(e) = self
            .bridge
            .post(&self.target, REMOVE_EVENT_LISTENER, payload)
        {
            log::warn!(
                "[Events] failed to unsubscribe {} on {}: {}",
                event_type,
                self.target,
                e
            );
        }
    }
}
