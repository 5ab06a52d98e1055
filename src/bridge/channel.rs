//! Channel
//!
//! Wraps the raw duplex transport. Outbound messages keep their relative
//! order; inbound messages reach exactly one installed listener.

use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::envelope::Envelope;
use super::error::{BridgeResult, TransportError};

/// A raw frame on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Inbound message handler installed on a transport.
pub type MessageListener = Rc<dyn Fn(WireMessage)>;

/// The transport primitive the bridge is layered on.
///
/// Implementations must deliver posted messages reliably and in order to the
/// native peer, and call the installed listener once per inbound message,
/// one message at a time.
pub trait Transport {
    /// Asynchronous post.
    fn post(&self, message: WireMessage) -> Result<(), TransportError>;

    /// Blocking round trip. Returns the native reply text, empty for
    /// "no value".
    fn send_sync(&self, message: &str) -> Result<String, TransportError>;

    /// Install (or with `None`, remove) the inbound listener. A new listener
    /// replaces the previous one.
    fn set_message_listener(&self, listener: Option<MessageListener>);
}

/// Truncate `text` to at most `limit` bytes on a char boundary.
pub(crate) fn excerpt(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub struct Channel {
    name: String,
    transport: Rc<dyn Transport>,
    listening: Cell<bool>,
    log_limit: usize,
}

impl Channel {
    pub fn new(name: impl Into<String>, transport: Rc<dyn Transport>, log_limit: usize) -> Self {
        Self {
            name: name.into(),
            transport,
            listening: Cell::new(false),
            log_limit,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    /// Post a text envelope.
    pub fn send(&self, envelope: &Envelope) -> BridgeResult<()> {
        let text = envelope.to_json()?;
        log::debug!(
            "[Channel {}] post {}",
            self.name,
            excerpt(&text, self.log_limit)
        );
        self.transport.post(WireMessage::Text(text))?;
        Ok(())
    }

    /// Post a binary frame.
    pub fn send_binary(&self, frame: Vec<u8>) -> BridgeResult<()> {
        log::debug!("[Channel {}] post binary ({} bytes)", self.name, frame.len());
        self.transport.post(WireMessage::Binary(frame))?;
        Ok(())
    }

    /// Blocking round trip. An empty reply means "no value".
    ///
    /// Blocks the calling realm until native answers, so only use it for
    /// calls documented as synchronous.
    pub fn send_sync(&self, envelope: &Envelope) -> BridgeResult<Option<Value>> {
        let text = envelope.to_json()?;
        log::debug!(
            "[Channel {}] sync {}",
            self.name,
            excerpt(&text, self.log_limit)
        );
        let reply = self.transport.send_sync(&text)?;
        if reply.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&reply)?))
    }

    /// Install the inbound listener, replacing any previous one.
    pub fn set_on_message(&self, listener: MessageListener) {
        self.transport.set_message_listener(Some(listener));
        self.listening.set(true);
    }

    /// Install the listener built by `make` unless one is already installed
    /// through this channel. Returns whether it was installed.
    pub fn listen_once(&self, make: impl FnOnce() -> MessageListener) -> bool {
        if self.listening.get() {
            log::debug!("[Channel {}] listener already installed", self.name);
            return false;
        }
        self.set_on_message(make());
        true
    }

    pub fn has_listener(&self) -> bool {
        self.listening.get()
    }

    /// Remove the inbound listener.
    pub fn detach(&self) {
        if self.listening.replace(false) {
            self.transport.set_message_listener(None);
        }
    }
}

type SyncResponder = Box<dyn FnMut(&str) -> String>;

/// In-process transport that records outbound traffic and lets the caller
/// inject inbound messages.
#[derive(Default)]
pub struct MemoryTransport {
    outbox: RefCell<Vec<WireMessage>>,
    sync_requests: RefCell<Vec<String>>,
    sync_responder: RefCell<Option<SyncResponder>>,
    listener: RefCell<Option<MessageListener>>,
    listener_installs: Cell<usize>,
    closed: Cell<bool>,
}

impl MemoryTransport {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Answer synchronous round trips with `responder`.
    pub fn respond_sync_with(&self, responder: impl FnMut(&str) -> String + 'static) {
        *self.sync_responder.borrow_mut() = Some(Box::new(responder));
    }

    /// Deliver an inbound message to the listener. Returns `false` if none is
    /// installed.
    pub fn deliver(&self, message: WireMessage) -> bool {
        let listener = self.listener.borrow().clone();
        match listener {
            Some(listener) => {
                listener(message);
                true
            }
            None => false,
        }
    }

    pub fn deliver_json(&self, value: &Value) -> bool {
        self.deliver(WireMessage::Text(value.to_string()))
    }

    /// Drain everything posted so far.
    pub fn take_sent(&self) -> Vec<WireMessage> {
        std::mem::take(&mut *self.outbox.borrow_mut())
    }

    /// Drain posted text frames as envelopes. Binary frames are dropped.
    pub fn take_envelopes(&self) -> Vec<Envelope> {
        self.take_sent()
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::Text(text) => Envelope::from_json(&text).ok(),
                WireMessage::Binary(_) => None,
            })
            .collect()
    }

    pub fn sync_requests(&self) -> Vec<String> {
        self.sync_requests.borrow().clone()
    }

    pub fn listener_installs(&self) -> usize {
        self.listener_installs.get()
    }

    pub fn close(&self) {
        self.closed.set(true);
    }
}

impl Transport for MemoryTransport {
    fn post(&self, message: WireMessage) -> Result<(), TransportError> {
        if self.closed.get() {
            return Err(TransportError::Closed);
        }
        self.outbox.borrow_mut().push(message);
        Ok(())
    }

    fn send_sync(&self, message: &str) -> Result<String, TransportError> {
        if self.closed.get() {
            return Err(TransportError::Closed);
        }
        self.sync_requests.borrow_mut().push(message.to_string());
        match self.sync_responder.borrow_mut().as_mut() {
            Some(responder) => Ok(responder(message)),
            None => Err(TransportError::SyncUnsupported),
        }
    }

    fn set_message_listener(&self, listener: Option<MessageListener>) {
        if listener.is_some() {
            self.listener_installs.set(self.listener_installs.get() + 1);
        }
        *self.listener.borrow_mut() = listener;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("hello", 10), "hello");
        assert_eq!(excerpt("hello", 3), "hel");
        assert_eq!(excerpt("héllo", 2), "h");
    }

    #[test]
    fn listen_once_guards_double_registration() {
        let transport = MemoryTransport::new();
        let channel = Channel::new("test", transport.clone(), 200);
        assert!(channel.listen_once(|| Rc::new(|_: WireMessage| {})));
        assert!(!channel.listen_once(|| Rc::new(|_: WireMessage| {})));
        assert_eq!(transport.listener_installs(), 1);

        channel.set_on_message(Rc::new(|_: WireMessage| {}));
        assert_eq!(transport.listener_installs(), 2);
    }

    #[test]
    fn send_sync_treats_empty_reply_as_no_value() {
        let transport = MemoryTransport::new();
        let channel = Channel::new("test", transport.clone(), 200);
        transport.respond_sync_with(|req| {
            if req.contains("empty") {
                String::new()
            } else {
                "[0, 1]".to_string()
            }
        });
        assert_eq!(channel.send_sync(&Envelope::new("empty")).unwrap(), None);
        assert_eq!(
            channel.send_sync(&Envelope::new("ids")).unwrap(),
            Some(json!([0, 1]))
        );
        assert_eq!(transport.sync_requests().len(), 2);
    }

    #[test]
    fn closed_transport_fails_sends() {
        let transport = MemoryTransport::new();
        let channel = Channel::new("test", transport.clone(), 200);
        transport.close();
        assert!(channel.send(&Envelope::new("x")).is_err());
        assert!(channel.send_binary(vec![1, 2]).is_err());
    }
}
