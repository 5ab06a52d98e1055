//! In-process Native Host
//!
//! The native side of a channel running on its own thread. No platform
//! APIs live here; extensions register the commands they serve.

mod builder;
mod client;
mod engine;
pub mod loopback;
mod router;

pub use builder::HostBuilder;
pub use client::{HostClient, HostCommand};
pub use engine::NativeHost;
pub use loopback::LoopbackTransport;
pub use router::{BinaryHandler, CommandHandler, CommandRouter, HostExtension, HostResult};
