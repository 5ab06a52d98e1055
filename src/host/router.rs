//! Command Router
//!
//! Native-side dispatch table. Extensions register one handler per command
//! name; the host thread feeds every realm message through the router.

use serde_json::{Value, json};
use std::collections::HashMap;

use super::client::HostClient;
use crate::bridge::codec::{BinaryObjectCall, decode_object_call};
use crate::bridge::{Envelope, Target};

/// What a handler produced.
///
/// `Ok(Some(value))` answers the request, `Ok(None)` sends nothing (the
/// handler may answer later through its `HostClient`), `Err(payload)` fails
/// the request with `payload`.
pub type HostResult<T> = Result<Option<T>, Value>;

pub type CommandHandler = Box<dyn FnMut(&Envelope, &HostClient) -> HostResult<Value> + Send>;
pub type BinaryHandler =
    Box<dyn FnMut(&BinaryObjectCall, &HostClient) -> HostResult<Vec<u8>> + Send>;

/// Trait for registering native commands with the host.
///
/// Implementors add their handlers to the router. The host knows nothing
/// about the APIs it serves.
pub trait HostExtension: Send + 'static {
    fn register(&self, router: &mut CommandRouter, client: HostClient);
}

#[derive(Default)]
pub struct CommandRouter {
    commands: HashMap<String, CommandHandler>,
    binary: HashMap<String, BinaryHandler>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `cmd`. A later registration for the same name replaces the
    /// earlier one.
    pub fn on(
        &mut self,
        cmd: impl Into<String>,
        handler: impl FnMut(&Envelope, &HostClient) -> HostResult<Value> + Send + 'static,
    ) -> &mut Self {
        let cmd = cmd.into();
        if self.commands.insert(cmd.clone(), Box::new(handler)).is_some() {
            log::warn!("[Host] handler for {} replaced", cmd);
        }
        self
    }

    /// Handle binary object calls to `method`.
    pub fn on_binary(
        &mut self,
        method: impl Into<String>,
        handler: impl FnMut(&BinaryObjectCall, &HostClient) -> HostResult<Vec<u8>> + Send + 'static,
    ) -> &mut Self {
        self.binary.insert(method.into(), Box::new(handler));
        self
    }

    fn dispatch(&mut self, envelope: &Envelope, client: &HostClient) -> HostResult<Value> {
        match self.commands.get_mut(&envelope.cmd) {
            Some(handler) => handler(envelope, client),
            None => {
                log::warn!("[Host] unknown command {}", envelope.cmd);
                Err(json!(format!("unknown command: {}", envelope.cmd)))
            }
        }
    }

    /// A posted text message.
    pub fn handle_text(&mut self, text: &str, client: &HostClient) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("[Host] malformed message dropped: {}", e);
                return;
            }
        };
        log::debug!("[Host] {} for {}", envelope.cmd, envelope.target());
        match self.dispatch(&envelope, client) {
            Ok(Some(value)) => client.reply(&envelope, Ok(value)),
            Ok(None) => {}
            Err(error) => client.reply(&envelope, Err(error)),
        }
    }

    /// A blocking round trip. Returns the reply text, empty for "no value".
    pub fn handle_sync(&mut self, text: &str, client: &HostClient) -> String {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("[Host] malformed sync message: {}", e);
                return String::new();
            }
        };
        match self.dispatch(&envelope, client) {
            Ok(Some(value)) => value.to_string(),
            Ok(None) => String::new(),
            Err(error) => {
                log::warn!("[Host] sync {} failed: {}", envelope.cmd, error);
                String::new()
            }
        }
    }

    /// A binary object call. Failures are reported as a text reply carrying
    /// the same correlation id.
    pub fn handle_binary(&mut self, frame: &[u8], client: &HostClient) {
        let call = match decode_object_call(frame) {
            Ok(call) => call,
            Err(e) => {
                log::warn!("[Host] bad binary frame dropped: {}", e);
                return;
            }
        };
        let outcome = match self.binary.get_mut(&call.method) {
            Some(handler) => handler(&call, client),
            None => {
                log::warn!("[Host] unknown binary method {}", call.method);
                Err(json!(format!("unknown method: {}", call.method)))
            }
        };
        let Some(id) = call.callback_id else {
            return;
        };
        match outcome {
            Ok(Some(bytes)) => client.push_binary(id, &bytes),
            Ok(None) => {}
            Err(error) => {
                let request = Envelope::new(call.command.as_str())
                    .addressed_to(&Target::Object(call.object_id))
                    .with_correlation(id);
                client.reply(&request, Err(error));
            }
        }
    }
}
