//! Loopback transport: connects a realm-side bridge to a `NativeHost` in
//! the same process.
//!
//! Messages from the host queue up until the realm pumps them, so inbound
//! delivery always happens on the realm's thread, one message at a time.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

use super::client::HostCommand;
use super::engine::NativeHost;
use crate::bridge::{
    CallError, FromResponse, MessageListener, Pending, Transport, TransportError, WireMessage,
};

pub struct LoopbackTransport {
    commands: Sender<HostCommand>,
    inbound: Receiver<WireMessage>,
    listener: RefCell<Option<MessageListener>>,
}

/// Connect to `host`. Only one realm can be connected to a host.
pub fn connect(host: &NativeHost) -> Result<Rc<LoopbackTransport>, TransportError> {
    let inbound = host
        .inbound
        .lock()
        .map_err(|_| TransportError::Other("host state poisoned".to_string()))?
        .take()
        .ok_or_else(|| TransportError::Other(format!("{} already has a realm", host.name())))?;
    Ok(Rc::new(LoopbackTransport {
        commands: host.commands(),
        inbound,
        listener: RefCell::new(None),
    }))
}

impl LoopbackTransport {
    fn deliver(&self, message: WireMessage) {
        let listener = self.listener.borrow().clone();
        match listener {
            Some(listener) => listener(message),
            None => log::warn!("[Loopback] no listener, message dropped"),
        }
    }

    /// Deliver everything the host has sent so far. Returns how many
    /// messages were delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            match self.inbound.try_recv() {
                Ok(message) => {
                    self.deliver(message);
                    delivered += 1;
                }
                Err(TryRecvError::Empty) => return delivered,
                Err(TryRecvError::Disconnected) => {
                    log::debug!("[Loopback] host disconnected");
                    return delivered;
                }
            }
        }
    }

    /// Wait up to `timeout` for the first message, then pump the rest.
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        match self.inbound.recv_timeout(timeout) {
            Ok(message) => {
                self.deliver(message);
                1 + self.pump()
            }
            Err(RecvTimeoutError::Timeout) => 0,
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!("[Loopback] host disconnected");
                0
            }
        }
    }

    /// Pump until `call` settles or `timeout` elapses.
    pub fn wait_for<T: FromResponse>(
        &self,
        call: &mut Pending<T>,
        timeout: Duration,
    ) -> Option<Result<T, CallError>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = call.try_result() {
                return Some(result);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.pump_timeout(remaining);
        }
    }
}

impl Transport for LoopbackTransport {
    fn post(&self, message: WireMessage) -> Result<(), TransportError> {
        self.commands
            .send(HostCommand::Post(message))
            .map_err(|_| TransportError::Closed)
    }

    fn send_sync(&self, message: &str) -> Result<String, TransportError> {
        let (reply, answer) = mpsc::channel();
        self.commands
            .send(HostCommand::SyncRequest {
                message: message.to_string(),
                reply,
            })
            .map_err(|_| TransportError::Closed)?;
        answer.recv().map_err(|_| TransportError::Closed)
    }

    fn set_message_listener(&self, listener: Option<MessageListener>) {
        *self.listener.borrow_mut() = listener;
    }
}
