//! Raw socket API
//!
//! `TcpSocket` is a binding object: native holds the real socket under the
//! proxy's object id, and the socket's events arrive addressed to that id.
//! The ready state follows the internal `readystate` event. Its listener only
//! captures the state cell, so the proxy never keeps itself alive.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cell::Cell;
use std::rc::Rc;

use crate::bridge::{
    BinaryCall, BindingObject, Bridge, BridgeResult, EventTarget, Listener, ObjectId, Payload,
    SlotId,
};

pub const TCP_SOCKET: &str = "TCPSocket";

pub const SOCKET_EVENTS: [&str; 6] = ["drain", "open", "close", "halfclose", "error", "data"];

const READY_STATE_EVENT: &str = "readystate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
    Halfclosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpOptions {
    pub local_address: String,
    pub local_port: u16,
    pub address_reuse: bool,
    pub no_delay: bool,
    pub use_secure_transport: bool,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            local_address: "127.0.0.1".to_string(),
            local_port: 0,
            address_reuse: true,
            no_delay: true,
            use_secure_transport: false,
        }
    }
}

pub struct TcpSocket {
    object: BindingObject,
    events: EventTarget,
    ready_state: Rc<Cell<ReadyState>>,
    remote_address: String,
    remote_port: u16,
    options: TcpOptions,
}

impl TcpSocket {
    /// Create the native socket and ask it to connect. Events that native
    /// fires in response reach listeners added before the realm next
    /// processes inbound messages.
    pub fn open(
        bridge: &Bridge,
        remote_address: &str,
        remote_port: u16,
        options: TcpOptions,
    ) -> BridgeResult<Self> {
        let object = bridge.create_object(TCP_SOCKET, Vec::new())?;

        let mut declared = SOCKET_EVENTS.to_vec();
        declared.push(READY_STATE_EVENT);
        let events = match object.declared_events(&declared) {
            Ok(events) => events,
            Err(e) => {
                object.destroy();
                return Err(e);
            }
        };

        let ready_state = Rc::new(Cell::new(ReadyState::Connecting));
        let observed = ready_state.clone();
        events.set_on(
            READY_STATE_EVENT,
            Some(Listener::new(move |event| {
                match serde_json::from_value::<ReadyState>(event.data.clone()) {
                    Ok(state) => observed.set(state),
                    Err(e) => log::warn!("[TCPSocket] bad ready state {}: {}", event.data, e),
                }
            })),
        );

        let socket = Self {
            object,
            events,
            ready_state,
            remote_address: remote_address.to_string(),
            remote_port,
            options,
        };
        let init = vec![
            json!(socket.remote_address),
            json!(socket.remote_port),
            serde_json::to_value(&socket.options)?,
        ];
        socket.object.post("init", Payload::Args(init))?;
        Ok(socket)
    }

    pub fn id(&self) -> ObjectId {
        self.object.id()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready_state.get()
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn local_address(&self) -> &str {
        &self.options.local_address
    }

    pub fn local_port(&self) -> u16 {
        self.options.local_port
    }

    pub fn options(&self) -> &TcpOptions {
        &self.options
    }

    /// Queue `data` for sending. Always `true`: whether more can be sent is
    /// only known natively, and asking would need a sync round trip.
    pub fn send(&self, data: &str) -> bool {
        if let Err(e) = self.object.post("_sendString", Payload::Args(vec![json!(data)])) {
            log::warn!("[TCPSocket {}] send failed: {}", self.id(), e);
        }
        true
    }

    /// Send raw bytes over the binary path. Resolves with native's reply.
    pub fn send_bytes(&self, data: Vec<u8>) -> BinaryCall {
        self.object.call_binary("send", data)
    }

    pub fn close(&self) {
        if self.ready_state.get() == ReadyState::Closed {
            return;
        }
        self.ready_state.set(ReadyState::Closing);
        self.post("_close");
    }

    pub fn halfclose(&self) {
        self.post("halfclose");
    }

    pub fn suspend(&self) {
        self.post("suspend");
    }

    pub fn resume(&self) {
        self.post("resume");
    }

    /// `on<type>` for one of `SOCKET_EVENTS`.
    pub fn set_on(&self, event_type: &str, handler: Option<Listener>) -> bool {
        if !SOCKET_EVENTS.contains(&event_type) {
            log::warn!("[TCPSocket {}] invalid event name: on{}", self.id(), event_type);
            return false;
        }
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

    /// Tell native to drop the socket. Idempotent.
    pub fn destroy(&self) -> bool {
        self.object.destroy()
    }

    fn post(&self, method: &str) {
        if let Err(e) = self.object.post(method, Payload::Empty) {
            log::warn!("[TCPSocket {}] {} failed: {}", self.id(), method, e);
        }
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("id", &self.id())
            .field("remote", &format_args!("{}:{}", self.remote_address, self.remote_port))
            .field("ready_state", &self.ready_state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeConfig, MemoryTransport, NEW_INSTANCE, OBJECT_COLLECTED};

    fn socket() -> (Bridge, TcpSocket, Rc<MemoryTransport>) {
        let transport = MemoryTransport::new();
        let bridge = Bridge::new(transport.clone(), BridgeConfig::new("raw_socket"));
        let socket = TcpSocket::open(&bridge, "10.0.0.1", 8080, TcpOptions::default()).unwrap();
        (bridge, socket, transport)
    }

    #[test]
    fn open_creates_then_inits() {
        let (_bridge, socket, transport) = socket();
        let sent = transport.take_envelopes();
        assert_eq!(sent[0].cmd, NEW_INSTANCE);
        assert_eq!(sent[0].name.as_deref(), Some(TCP_SOCKET));
        let init = sent.iter().find(|e| e.cmd == "init").unwrap();
        assert_eq!(init.object_id, Some(socket.id()));
        assert_eq!(init.args[0], json!("10.0.0.1"));
        assert_eq!(init.args[2]["localAddress"], json!("127.0.0.1"));
        assert_eq!(init.args[2]["noDelay"], json!(true));
        assert_eq!(socket.ready_state(), ReadyState::Connecting);
    }

    #[test]
    fn ready_state_follows_native() {
        let (_bridge, socket, transport) = socket();
        transport.deliver_json(&json!({
            "cmd": "readystate", "objectId": socket.id(), "data": "open",
        }));
        assert_eq!(socket.ready_state(), ReadyState::Open);

        transport.take_sent();
        socket.close();
        assert_eq!(socket.ready_state(), ReadyState::Closing);
        assert_eq!(transport.take_envelopes()[0].cmd, "_close");

        transport.deliver_json(&json!({
            "cmd": "readystate", "objectId": socket.id(), "data": "closed",
        }));
        socket.close();
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn send_always_reports_true() {
        let (_bridge, socket, transport) = socket();
        transport.take_sent();
        assert!(socket.send("hello"));
        let sent = transport.take_envelopes();
        assert_eq!(sent[0].cmd, "_sendString");
        assert_eq!(sent[0].args, vec![json!("hello")]);
    }

    #[test]
    fn readystate_is_not_a_public_slot() {
        let (_bridge, socket, _transport) = socket();
        assert!(!socket.set_on("readystate", None));
        assert!(socket.set_on("data", Some(Listener::new(|_| {}))));
    }

    #[test]
    fn dropping_the_socket_collects_it() {
        let (bridge, socket, transport) = socket();
        let id = socket.id();
        transport.take_sent();
        drop(socket);
        assert!(!bridge.is_object_live(id));
        let sent = transport.take_envelopes();
        assert!(sent.iter().any(|e| e.cmd == OBJECT_COLLECTED && e.args == vec![json!(id)]));
    }
}
