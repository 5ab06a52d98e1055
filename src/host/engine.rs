//! Native Host
//!
//! Runs the native side of a channel on a dedicated worker thread. The realm
//! talks to it through a `LoopbackTransport`; handlers talk back through a
//! `HostClient`.

use std::sync::Mutex;
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};

use super::client::{HostClient, HostCommand};
use super::router::{CommandRouter, HostExtension};
use crate::bridge::WireMessage;

pub struct NativeHost {
    name: String,
    client: HostClient,
    commands: Sender<HostCommand>,
    /// Realm-bound messages; taken by the first `loopback::connect`.
    pub(crate) inbound: Mutex<Option<Receiver<WireMessage>>>,
    handle: Option<JoinHandle<()>>,
}

impl NativeHost {
    pub(crate) fn start(
        name: String,
        extensions: Vec<Box<dyn HostExtension>>,
        client: HostClient,
        commands: Sender<HostCommand>,
        receiver: Receiver<HostCommand>,
        inbound: Receiver<WireMessage>,
    ) -> std::io::Result<Self> {
        let client_for_thread = client.clone();
        let thread_name = name.clone();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut router = CommandRouter::new();
                for extension in &extensions {
                    extension.register(&mut router, client_for_thread.clone());
                }
                run_host_loop(&thread_name, receiver, router, client_for_thread);
            }));

            if let Err(e) = result {
                log::error!("[Host] thread panicked: {:?}", e);
            }
        })?;

        Ok(Self {
            name,
            client,
            commands,
            inbound: Mutex::new(Some(inbound)),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A client handle for pushing to the realm from outside a handler.
    pub fn client(&self) -> HostClient {
        self.client.clone()
    }

    pub(crate) fn commands(&self) -> Sender<HostCommand> {
        self.commands.clone()
    }

    /// Stop the host thread and wait for it.
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(HostCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[Host {}] thread did not stop cleanly", self.name);
            }
        }
    }
}

impl Drop for NativeHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Main loop for the host thread.
fn run_host_loop(
    name: &str,
    receiver: Receiver<HostCommand>,
    mut router: CommandRouter,
    client: HostClient,
) {
    log::info!("[Host {}] thread started", name);

    loop {
        match receiver.recv() {
            Ok(HostCommand::Post(WireMessage::Text(text))) => {
                router.handle_text(&text, &client);
            }
            Ok(HostCommand::Post(WireMessage::Binary(frame))) => {
                router.handle_binary(&frame, &client);
            }
            Ok(HostCommand::SyncRequest { message, reply }) => {
                let answer = router.handle_sync(&message, &client);
                if reply.send(answer).is_err() {
                    log::warn!("[Host {}] sync caller went away", name);
                }
            }
            Ok(HostCommand::Shutdown) => {
                log::info!("[Host {}] shutting down", name);
                break;
            }
            Err(e) => {
                log::error!("[Host {}] command channel error: {}", name, e);
                break;
            }
        }
    }

    log::info!("[Host {}] thread stopped", name);
}
