//! Device APIs
//!
//! Thin call sites over the bridge. Each API is a command-name table plus
//! the events it exposes; all protocol work happens in `crate::bridge`.

pub mod device_capabilities;
pub mod messaging;
pub mod raw_socket;

pub use device_capabilities::{DeviceCapabilities, DisplayUnit, StorageUnit};
pub use messaging::{Messaging, MessagingCursor, SmsManager};
pub use raw_socket::{ReadyState, TcpOptions, TcpSocket};
