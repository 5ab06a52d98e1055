//! Device capability queries and storage/display hotplug events.

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;

use crate::bridge::{
    Bridge, CallError, Event, EventTarget, Listener, Payload, PendingCall, SlotId, Target,
};

pub const DEVICE_EVENTS: [&str; 4] = [
    "storageattach",
    "storagedetach",
    "displayconnect",
    "displaydisconnect",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUnit {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub capacity: u64,
    #[serde(default)]
    pub avail_capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayUnit {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub is_internal: bool,
    #[serde(default)]
    pub dpi_x: f64,
    #[serde(default)]
    pub dpi_y: f64,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub avail_width: u32,
    #[serde(default)]
    pub avail_height: u32,
}

#[derive(Debug, Deserialize)]
struct StorageInfo {
    storages: Vec<StorageUnit>,
}

#[derive(Debug, Deserialize)]
struct DisplayInfo {
    displays: Vec<DisplayUnit>,
}

fn decode<T: DeserializeOwned>(what: &str, value: Value) -> Result<T, CallError> {
    serde_json::from_value(value).map_err(|e| CallError::InvalidReply(format!("{}: {}", what, e)))
}

/// Storage unit carried by a `storageattach`/`storagedetach` event.
pub fn storage_of(event: &Event) -> Result<StorageUnit, CallError> {
    decode("storage event", event.data.clone())
}

/// Display unit carried by a `displayconnect`/`displaydisconnect` event.
pub fn display_of(event: &Event) -> Result<DisplayUnit, CallError> {
    decode("display event", event.data.clone())
}

#[derive(Clone)]
pub struct DeviceCapabilities {
    bridge: Bridge,
    events: EventTarget,
}

impl DeviceCapabilities {
    pub fn new(bridge: Bridge) -> Self {
        let events = bridge.event_target(Target::Extension, &DEVICE_EVENTS);
        Self { bridge, events }
    }

    pub fn cpu_info(&self) -> PendingCall {
        self.query("getCPUInfo")
    }

    pub fn av_codecs(&self) -> PendingCall {
        self.query("getCodecsInfo")
    }

    pub fn memory_info(&self) -> PendingCall {
        self.query("getMemoryInfo")
    }

    pub fn display_info(&self) -> impl Future<Output = Result<Vec<DisplayUnit>, CallError>> + use<> {
        self.query("getDisplayInfo").map(|reply| {
            reply.and_then(|body| decode::<DisplayInfo>("display info", body).map(|i| i.displays))
        })
    }

    pub fn storage_info(&self) -> impl Future<Output = Result<Vec<StorageUnit>, CallError>> + use<> {
        self.query("getStorageInfo").map(|reply| {
            reply.and_then(|body| decode::<StorageInfo>("storage info", body).map(|i| i.storages))
        })
    }

    /// `on<type>` for one of `DEVICE_EVENTS`.
    pub fn set_on(&self, event_type: &str, handler: Option<Listener>) -> bool {
        self.events.set_on(event_type, handler)
    }

    pub fn add_event_listener(&self, event_type: &str, listener: &Listener) -> Option<SlotId> {
        self.events.add_event_listener(event_type, listener)
    }

    pub fn remove_event_listener(&self, event_type: &str, listener: &Listener) -> bool {
        self.events.remove_event_listener(event_type, listener)
    }

    pub fn events(&self) -> &EventTarget {
        &self.events
    }

    fn query(&self, cmd: &str) -> PendingCall {
        self.bridge.call(&Target::Extension, cmd, Payload::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{ADD_EVENT_LISTENER, BridgeConfig, MemoryTransport, REMOVE_EVENT_LISTENER};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn device() -> (DeviceCapabilities, Rc<MemoryTransport>) {
        let transport = MemoryTransport::new();
        let bridge = Bridge::new(transport.clone(), BridgeConfig::new("device_capabilities"));
        (DeviceCapabilities::new(bridge), transport)
    }

    #[test]
    fn storage_info_decodes_units() {
        let (device, transport) = device();
        let mut pending = Box::pin(device.storage_info());
        assert!((&mut pending).now_or_never().is_none());
        let sent = transport.take_envelopes();
        assert_eq!(sent[0].cmd, "getStorageInfo");
        let id = sent[0].correlation_id.unwrap();
        transport.deliver_json(&json!({
            "cmd": "getStorageInfo_ret",
            "correlationId": id.get(),
            "data": {"body": {"storages": [
                {"id": "1", "name": "sd", "type": "removable", "capacity": 64, "availCapacity": 32}
            ]}, "error": null},
        }));
        let units = pending.now_or_never().unwrap().unwrap();
        assert_eq!(units[0].kind, "removable");
        assert_eq!(units[0].avail_capacity, 32);
    }

    #[test]
    fn malformed_display_info_is_invalid_reply() {
        let (device, transport) = device();
        let mut pending = Box::pin(device.display_info());
        assert!((&mut pending).now_or_never().is_none());
        let id = transport.take_envelopes()[0].correlation_id.unwrap();
        transport.deliver_json(&json!({
            "cmd": "getDisplayInfo_ret",
            "correlationId": id.get(),
            "data": {"body": {"displays": "none"}},
        }));
        assert!(matches!(
            pending.now_or_never(),
            Some(Err(CallError::InvalidReply(_)))
        ));
    }

    #[test]
    fn storage_events_subscribe_and_decode() {
        let (device, transport) = device();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        assert!(device.set_on(
            "storageattach",
            Some(Listener::new(move |e| {
                sink.borrow_mut().push(storage_of(e).map(|s| s.name));
            }))
        ));
        let sent = transport.take_envelopes();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].cmd, ADD_EVENT_LISTENER);
        assert_eq!(sent[0].args, vec![json!("storageattach")]);

        transport.deliver_json(&json!({
            "cmd": "storageattach",
            "data": {"id": "2", "name": "usb", "type": "removable"},
        }));
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].as_deref().ok(), Some("usb"));

        assert!(device.set_on("storageattach", None));
        let sent = transport.take_envelopes();
        assert_eq!(sent[0].cmd, REMOVE_EVENT_LISTENER);
    }
}
