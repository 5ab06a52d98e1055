//! Message Correlation & Event Dispatch Bridge
//!
//! Turns a single ordered duplex channel into a correlated RPC layer and a
//! publish/subscribe layer for native-pushed events, with lifecycle tracking
//! for binding objects.

mod binding;
mod channel;
pub mod codec;
mod config;
mod context;
mod correlation;
mod dispatcher;
mod envelope;
mod error;
mod events;
mod properties;

pub use binding::{BindingObject, BindingObjectRegistry, NEW_INSTANCE, OBJECT_COLLECTED};
pub use channel::{Channel, MemoryTransport, MessageListener, Transport, WireMessage};
pub use config::BridgeConfig;
pub use context::{Bridge, WeakBridge};
pub use correlation::{Completion, CorrelationTable, Disposition, IdAllocator};
pub use dispatcher::{
    Arg, BinaryCall, Callback, FromResponse, Invocation, InvokeOptions, Payload, Pending,
    PendingCall, Response,
};
pub use envelope::{CorrelationId, Envelope, ObjectId, ROOT_OBJECT_ID, Target, UPDATE_PROPERTY};
pub use error::{BridgeError, BridgeResult, CallError, CodecError, TransportError};
pub use events::{
    ADD_EVENT_LISTENER, Event, EventRegistry, EventTarget, Listener, REMOVE_EVENT_LISTENER,
    SlotId, Subscribed, dispatch_to,
};
pub use properties::{GET_PROPERTY, PropertyMirror, SET_PROPERTY};
