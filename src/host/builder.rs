use std::sync::mpsc;

use super::client::HostClient;
use super::engine::NativeHost;
use super::router::HostExtension;

pub struct HostBuilder {
    name: String,
    extensions: Vec<Box<dyn HostExtension>>,
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBuilder {
    pub fn new() -> Self {
        HostBuilder {
            name: "native-host".to_string(),
            extensions: vec![],
        }
    }

    /// Thread name, also used in log lines.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_extension(mut self, extension: impl HostExtension) -> Self {
        self.extensions.push(Box::new(extension));
        self
    }

    /// Start the host thread. Extensions register on that thread before the
    /// first command is processed.
    pub fn build(self) -> std::io::Result<NativeHost> {
        let (commands, receiver) = mpsc::channel();
        let (realm, inbound) = mpsc::channel();
        let client = HostClient { realm };
        NativeHost::start(self.name, self.extensions, client, commands, receiver, inbound)
    }
}
