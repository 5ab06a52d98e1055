//! Native property mirror.
//!
//! A mirrored property is read once from native with a synchronous
//! `getProperty` and then served from the cache. Native pushes
//! `updateProperty` when the value changes.

use serde_json::Value;
use std::collections::HashMap;

use super::context::Bridge;
use super::envelope::{Envelope, Target};
use super::error::BridgeResult;

pub const GET_PROPERTY: &str = "getProperty";
pub const SET_PROPERTY: &str = "setProperty";

/// Cached property values per target. `None` marks a mirrored property whose
/// value is stale.
#[derive(Debug, Default)]
pub struct PropertyMirror {
    targets: HashMap<Target, HashMap<String, Option<Value>>>,
}

impl PropertyMirror {
    pub fn store(&mut self, target: &Target, name: &str, value: Value) {
        self.targets
            .entry(target.clone())
            .or_default()
            .insert(name.to_string(), Some(value));
    }

    pub fn get(&self, target: &Target, name: &str) -> Option<&Value> {
        self.targets.get(target)?.get(name)?.as_ref()
    }

    pub fn is_mirrored(&self, target: &Target, name: &str) -> bool {
        self.targets
            .get(target)
            .is_some_and(|props| props.contains_key(name))
    }

    /// Mark stale; returns `false` if the property is not mirrored.
    pub fn invalidate(&mut self, target: &Target, name: &str) -> bool {
        match self.targets.get_mut(target).and_then(|p| p.get_mut(name)) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    pub fn forget_target(&mut self, target: &Target) {
        self.targets.remove(target);
    }
}

impl Bridge {
    /// Start mirroring `name` on `target`, reading its current value.
    pub fn define_property(&self, target: &Target, name: &str) -> BridgeResult<Value> {
        let value = self.read_property(target, name)?;
        self.state_mut().properties.store(target, name, value.clone());
        Ok(value)
    }

    /// Mirrored value, re-read from native if stale. Unmirrored properties
    /// are read but not cached.
    pub fn get_property(&self, target: &Target, name: &str) -> BridgeResult<Value> {
        let (mirrored, cached) = {
            let state = self.state();
            (
                state.properties.is_mirrored(target, name),
                state.properties.get(target, name).cloned(),
            )
        };
        if let Some(value) = cached {
            return Ok(value);
        }
        if mirrored {
            return self.define_property(target, name);
        }
        self.read_property(target, name)
    }

    /// Write through to native, then update the mirror.
    pub fn set_property(&self, target: &Target, name: &str, value: Value) -> BridgeResult<()> {
        let envelope = Envelope::new(SET_PROPERTY)
            .with_name(name)
            .with_args(vec![value.clone()])
            .addressed_to(target);
        self.sync_round_trip(&envelope)?;
        self.state_mut().properties.store(target, name, value);
        Ok(())
    }

    /// Cached value only, no round trip.
    pub fn cached_property(&self, target: &Target, name: &str) -> Option<Value> {
        self.state().properties.get(target, name).cloned()
    }

    fn read_property(&self, target: &Target, name: &str) -> BridgeResult<Value> {
        let envelope = Envelope::new(GET_PROPERTY)
            .with_name(name)
            .addressed_to(target);
        Ok(self.sync_round_trip(&envelope)?.unwrap_or(Value::Null))
    }

    /// Handle an inbound `updateProperty`. A sync re-read is not allowed
    /// here, so the new value comes from `data`; without one the entry is
    /// marked stale.
    pub(crate) fn refresh_property(&self, target: &Target, envelope: &Envelope) {
        let Some(name) = envelope.name.as_deref() else {
            log::warn!("[Bridge {}] updateProperty without a name", self.name());
            return;
        };
        let mut state = self.state_mut();
        if !state.properties.is_mirrored(target, name) {
            log::debug!(
                "[Bridge {}] update for unmirrored property {} on {} ignored",
                self.name(),
                name,
                target
            );
            return;
        }
        match &envelope.data {
            Some(value) => state.properties.store(target, name, value.clone()),
            None => {
                state.properties.invalidate(target, name);
            }
        }
    }
}
