use serde_json::{Value, json};
use std::sync::mpsc;

use crate::bridge::codec::encode_binary_reply;
use crate::bridge::{CorrelationId, Envelope, Target, UPDATE_PROPERTY, WireMessage};

/// Commands that can be sent to the host thread.
#[derive(Debug)]
pub enum HostCommand {
    /// A message posted by the realm.
    Post(WireMessage),
    /// A blocking round trip; the answer goes back on `reply`.
    SyncRequest {
        message: String,
        reply: mpsc::Sender<String>,
    },
    /// Stop the host thread.
    Shutdown,
}

/// Handle the native side uses to talk back to the realm.
///
/// Cheap to clone and `Send`, so handlers can keep one and push events later
/// from any thread.
#[derive(Clone)]
pub struct HostClient {
    pub(crate) realm: mpsc::Sender<WireMessage>,
}

impl HostClient {
    /// Send a raw text envelope.
    pub fn send(&self, envelope: &Envelope) {
        match envelope.to_json() {
            Ok(text) => {
                if let Err(e) = self.realm.send(WireMessage::Text(text)) {
                    log::warn!("[Host] realm is gone, dropping {}: {}", envelope.cmd, e);
                }
            }
            Err(e) => log::error!("[Host] failed to encode {}: {}", envelope.cmd, e),
        }
    }

    /// Push an uncorrelated event to `target`.
    pub fn push_event(&self, target: &Target, event_type: &str, data: Value) {
        log::debug!("[Host] event {} -> {}", event_type, target);
        self.send(&Envelope::new(event_type).with_data(data).addressed_to(target));
    }

    /// Answer a correlated request. Uncorrelated requests get nothing.
    pub fn reply(&self, request: &Envelope, outcome: Result<Value, Value>) {
        let Some(id) = request.correlation_id else {
            return;
        };
        let data = match outcome {
            Ok(body) => json!({ "body": body, "error": null }),
            Err(error) => json!({ "error": error }),
        };
        let mut envelope = Envelope::new(format!("{}_ret", request.cmd))
            .with_data(data)
            .with_correlation(id);
        envelope.object_id = request.object_id;
        envelope.constructor_name = request.constructor_name.clone();
        self.send(&envelope);
    }

    /// Invoke a persistent continuation held by the realm.
    pub fn callback(&self, target: &Target, id: CorrelationId, event_type: &str, data: Value) {
        self.send(
            &Envelope::new(event_type)
                .with_data(json!({ "body": data }))
                .addressed_to(target)
                .with_correlation(id),
        );
    }

    /// Complete a binary call.
    pub fn push_binary(&self, id: CorrelationId, payload: &[u8]) {
        if let Err(e) = self
            .realm
            .send(WireMessage::Binary(encode_binary_reply(id, payload)))
        {
            log::warn!("[Host] realm is gone, dropping binary reply {}: {}", id, e);
        }
    }

    /// Tell the realm a mirrored property changed.
    pub fn update_property(&self, target: &Target, name: &str, value: Option<Value>) {
        let mut envelope = Envelope::new(UPDATE_PROPERTY)
            .with_name(name)
            .addressed_to(target);
        envelope.data = value;
        self.send(&envelope);
    }
}
