//! Correlated RPC and native event dispatch for extension APIs.
//!
//! A [`Bridge`] sits on one ordered duplex channel to a native host. It
//! correlates replies with calls, dispatches native-pushed events to
//! listeners, and tracks binding objects that mirror native state.

pub mod apis;
pub mod bridge;
pub mod host;

pub use bridge::{
    BindingObject, Bridge, BridgeConfig, BridgeError, BridgeResult, CallError, Envelope,
    EventTarget, Listener, Payload, PendingCall, Target, Transport, WireMessage,
};
pub use host::{HostBuilder, HostClient, HostExtension, NativeHost};
