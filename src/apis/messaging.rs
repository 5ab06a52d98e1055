//! Messaging API
//!
//! SMS manager plus message store queries. Native pushes SMS events without
//! being asked, so listeners here never subscribe on the native side.

use futures_util::FutureExt;
use serde_json::{Value, json};
use std::future::Future;

use crate::bridge::{
    Bridge, BridgeResult, CallError, EventRegistry, EventTarget, Listener, Payload, PendingCall,
    SlotId, Target,
};

/// Fixed slots, in slot order.
pub const SMS_EVENTS: [&str; 6] = [
    "received",
    "sent",
    "deliverysuccess",
    "deliveryerror",
    "serviceadded",
    "serviceremoved",
];

/// SMS half of the messaging API.
#[derive(Clone)]
pub struct SmsManager {
    bridge: Bridge,
    events: EventTarget,
}

impl SmsManager {
    pub fn kind(&self) -> &'static str {
        "sms"
    }

    /// Service ids, read synchronously.
    pub fn service_ids(&self) -> BridgeResult<Vec<Value>> {
        let reply = self
            .bridge
            .call_sync(&Target::Extension, "msg_smsServiceId", Payload::Empty)?;
        Ok(match reply {
            Some(Value::Array(ids)) => ids,
            Some(other) => vec![other],
            None => Vec::new(),
        })
    }

    pub fn send(&self, to: &str, text: &str, service_id: Option<Value>) -> PendingCall {
        self.call(
            "msg_smsSend",
            json!({ "phone": to, "message": text, "serviceID": service_id }),
        )
    }

    pub fn clear(&self, service_id: Option<Value>) -> PendingCall {
        self.call("msg_smsClear", json!({ "serviceID": service_id }))
    }

    pub fn segment_info(&self, text: &str, service_id: Option<Value>) -> PendingCall {
        self.call(
            "msg_smsSegmentInfo",
            json!({ "text": text, "serviceID": service_id }),
        )
    }

    /// `on<type>` for one of `SMS_EVENTS`.
    pub fn set_on(&self, event_type: &str, handler: Option<Listener>) -> bool {
        self.events.set_on(event_type, handler)
    }

    pub fn events(&self) -> &EventTarget {
        &self.events
    }

    fn call(&self, cmd: &str, data: Value) -> PendingCall {
        self.bridge.call(&Target::Extension, cmd, Payload::Data(data))
    }
}

/// Result set of `find_messages`, walked in both directions.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagingCursor {
    messages: Vec<Value>,
    position: usize,
}

impl MessagingCursor {
    pub fn new(messages: Vec<Value>) -> Self {
        Self {
            messages,
            position: 0,
        }
    }

    /// Build from a `find_messages` reply body (`{"results": [...]}`).
    pub fn from_reply(body: Value) -> Result<Self, CallError> {
        match body {
            Value::Object(mut map) => match map.remove("results") {
                Some(Value::Array(results)) => Ok(Self::new(results)),
                Some(Value::Null) | None => Ok(Self::new(Vec::new())),
                Some(other) => Err(CallError::InvalidReply(format!(
                    "results is not an array: {}",
                    other
                ))),
            },
            other => Err(CallError::InvalidReply(format!(
                "find_messages reply is not an object: {}",
                other
            ))),
        }
    }

    /// The message at the cursor, then advance. `None` past the end.
    pub fn next(&mut self) -> Option<&Value> {
        let message = self.messages.get(self.position)?;
        self.position += 1;
        Some(message)
    }

    /// Step back and return that message. `None` at the start.
    pub fn previous(&mut self) -> Option<&Value> {
        self.position = self.position.checked_sub(1)?;
        self.messages.get(self.position)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// The messaging extension object.
#[derive(Clone)]
pub struct Messaging {
    bridge: Bridge,
    sms: SmsManager,
}

impl Messaging {
    pub fn new(bridge: Bridge) -> Self {
        let events = bridge.event_target_with(Target::Extension, || {
            EventRegistry::new(&SMS_EVENTS).local_only()
        });
        let sms = SmsManager {
            bridge: bridge.clone(),
            events,
        };
        Self { bridge, sms }
    }

    pub fn sms(&self) -> &SmsManager {
        &self.sms
    }

    /// Dynamic listener for any messaging event. `None` for an empty type.
    pub fn add_event_listener(&self, event_type: &str, listener: &Listener) -> Option<SlotId> {
        self.sms.events.add_event_listener(event_type, listener)
    }

    pub fn remove_event_listener(&self, event_type: &str, listener: &Listener) -> bool {
        self.sms.events.remove_event_listener(event_type, listener)
    }

    pub fn find_messages(
        &self,
        filter: Value,
        options: Value,
    ) -> impl Future<Output = Result<MessagingCursor, CallError>> + use<> {
        self.call(
            "msg_findMessages",
            json!({ "filter": filter, "options": options }),
        )
        .map(|reply| reply.and_then(MessagingCursor::from_reply))
    }

    pub fn get_message(&self, kind: &str, message_id: &str) -> PendingCall {
        self.call(
            "msg_getMessage",
            json!({ "type": kind, "messageID": message_id }),
        )
    }

    pub fn delete_message(&self, kind: &str, message_id: &str) -> PendingCall {
        self.call(
            "msg_deleteMessage",
            json!({ "type": kind, "messageID": message_id }),
        )
    }

    pub fn delete_conversation(&self, kind: &str, conversation_id: &str) -> PendingCall {
        self.call(
            "msg_deleteConversation",
            json!({ "type": kind, "conversationID": conversation_id }),
        )
    }

    /// `value` defaults to `true`.
    pub fn mark_message_read(&self, kind: &str, message_id: &str, value: Option<bool>) -> PendingCall {
        self.call(
            "msg_markMessageRead",
            json!({ "type": kind, "messageID": message_id, "value": value.unwrap_or(true) }),
        )
    }

    /// `value` defaults to `true`.
    pub fn mark_conversation_read(
        &self,
        kind: &str,
        conversation_id: &str,
        value: Option<bool>,
    ) -> PendingCall {
        self.call(
            "msg_markConversationRead",
            json!({
                "type": kind,
                "conversationID": conversation_id,
                "value": value.unwrap_or(true),
            }),
        )
    }

    fn call(&self, cmd: &str, data: Value) -> PendingCall {
        self.bridge.call(&Target::Extension, cmd, Payload::Data(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeConfig, Envelope, MemoryTransport};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn messaging() -> (Messaging, Rc<MemoryTransport>) {
        let transport = MemoryTransport::new();
        let bridge = Bridge::new(transport.clone(), BridgeConfig::new("messaging"));
        (Messaging::new(bridge), transport)
    }

    #[test]
    fn cursor_walks_both_ways() {
        let mut cursor = MessagingCursor::new(vec![json!("a"), json!("b")]);
        assert_eq!(cursor.previous(), None);
        assert_eq!(cursor.next(), Some(&json!("a")));
        assert_eq!(cursor.next(), Some(&json!("b")));
        assert_eq!(cursor.next(), None);
        assert_eq!(cursor.previous(), Some(&json!("b")));
        assert_eq!(cursor.previous(), Some(&json!("a")));
        assert_eq!(cursor.previous(), None);
    }

    #[test]
    fn cursor_rejects_bad_replies() {
        assert!(MessagingCursor::from_reply(json!({"results": null})).unwrap().is_empty());
        assert!(matches!(
            MessagingCursor::from_reply(json!("nope")),
            Err(CallError::InvalidReply(_))
        ));
    }

    #[test]
    fn fixed_slots_do_not_notify_native() {
        let (messaging, transport) = messaging();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        assert!(messaging.sms().set_on(
            "received",
            Some(Listener::new(move |e| sink.borrow_mut().push(e.data.clone())))
        ));
        assert!(!messaging.sms().set_on("bogus", None));
        let slot = messaging
            .add_event_listener("received", &Listener::new(|_| {}))
            .unwrap();
        assert_eq!(slot, SMS_EVENTS.len());
        assert!(transport.take_sent().is_empty());

        transport.deliver_json(&json!({"cmd": "received", "data": {"body": "hi"}}));
        assert_eq!(*seen.borrow(), vec![json!({"body": "hi"})]);
    }

    #[test]
    fn mark_read_defaults_to_true() {
        let (messaging, transport) = messaging();
        let _call = messaging.mark_message_read("sms", "m1", None);
        let sent: Vec<Envelope> = transport.take_envelopes();
        assert_eq!(sent[0].cmd, "msg_markMessageRead");
        assert_eq!(sent[0].data.as_ref().unwrap()["value"], json!(true));
    }

    #[test]
    fn find_messages_resolves_to_cursor() {
        let (messaging, transport) = messaging();
        let mut pending = Box::pin(messaging.find_messages(json!({}), json!({"limit": 2})));
        assert!((&mut pending).now_or_never().is_none());
        let id = transport.take_envelopes()[0].correlation_id.unwrap();
        transport.deliver_json(&json!({
            "cmd": "msg_findMessages_ret",
            "correlationId": id.get(),
            "data": {"body": {"results": [{"id": 1}]}, "error": null},
        }));
        let mut cursor = pending.now_or_never().unwrap().unwrap();
        assert_eq!(cursor.next(), Some(&json!({"id": 1})));
    }
}
