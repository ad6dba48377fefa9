//! Single-owner task for a [`CallRegistry`]
//!
//! The registry is not shared between tasks. [`RegistryDriver::spawn`] moves it
//! onto one tokio task that waits on three things at once: commands from
//! [`RegistryHandle`]s, classification results from the lookups the registry
//! started, and the earliest retention deadline. Every mutation and every
//! listener callback therefore happens on that task, in arrival order.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

use crate::classification::ClassificationResult;
use crate::error::{RegistryError, Result};
use crate::events::{CallListEvent, CallListListener, invoke_isolated};
use crate::registry::CallRegistry;
use crate::telephony::TelephonyEvent;

type RegistryClosure = Box<dyn FnOnce(&mut CallRegistry) + Send>;

/// Work for the owner task
pub enum RegistryCommand {
    Telephony(TelephonyEvent),
    Classification(ClassificationResult),
    /// Retire every disconnected call without waiting for its retention
    DismissPendingDisconnects,
    AddListener(Arc<dyn CallListListener>),
    RemoveListener(Arc<dyn CallListListener>),
    WithRegistry(RegistryClosure),
    Shutdown,
}

impl fmt::Debug for RegistryCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryCommand::Telephony(event) => f.debug_tuple("Telephony").field(event).finish(),
            RegistryCommand::Classification(result) => {
                f.debug_tuple("Classification").field(result).finish()
            }
            RegistryCommand::DismissPendingDisconnects => f.write_str("DismissPendingDisconnects"),
            RegistryCommand::AddListener(_) => f.write_str("AddListener"),
            RegistryCommand::RemoveListener(_) => f.write_str("RemoveListener"),
            RegistryCommand::WithRegistry(_) => f.write_str("WithRegistry"),
            RegistryCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Owns a registry and runs its event loop
pub struct RegistryDriver {
    registry: CallRegistry,
    commands: mpsc::Receiver<RegistryCommand>,
    classifications: Option<mpsc::UnboundedReceiver<ClassificationResult>>,
}

impl RegistryDriver {
    /// Start the owner task; the registry comes back out of the join handle
    /// after shutdown
    pub fn spawn(mut registry: CallRegistry) -> (RegistryHandle, JoinHandle<CallRegistry>) {
        let (tx, rx) = mpsc::channel(registry.config().command_channel_capacity.max(1));
        let handle = RegistryHandle {
            commands: tx,
            events: registry.event_sender(),
        };
        let driver = RegistryDriver {
            classifications: registry.take_classification_receiver(),
            registry,
            commands: rx,
        };
        (handle, tokio::spawn(driver.run()))
    }

    async fn run(self) -> CallRegistry {
        let RegistryDriver {
            mut registry,
            mut commands,
            mut classifications,
        } = self;
        info!("Call registry driver started");

        loop {
            let deadline = registry.next_retention_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(RegistryCommand::Shutdown) | None => break,
                    Some(command) => handle_command(&mut registry, command),
                },
                result = next_classification(&mut classifications) => {
                    registry.apply_classification(result);
                }
                _ = retention_due(deadline) => {
                    let retired = registry.fire_due_retentions();
                    debug!("Retention timer fired; retired {} calls", retired);
                }
            }
        }

        info!("Call registry driver stopped with {} calls", registry.len());
        registry
    }
}

fn handle_command(registry: &mut CallRegistry, command: RegistryCommand) {
    match command {
        RegistryCommand::Telephony(event) => registry.handle_telephony_event(event),
        RegistryCommand::Classification(result) => {
            registry.apply_classification(result);
        }
        RegistryCommand::DismissPendingDisconnects => registry.on_error_dialog_dismissed(),
        RegistryCommand::AddListener(listener) => {
            registry.add_listener(listener);
        }
        RegistryCommand::RemoveListener(listener) => {
            registry.remove_listener(&listener);
        }
        RegistryCommand::WithRegistry(f) => invoke_isolated("registry closure", || f(registry)),
        RegistryCommand::Shutdown => {}
    }
}

async fn next_classification(
    receiver: &mut Option<mpsc::UnboundedReceiver<ClassificationResult>>,
) -> ClassificationResult {
    if let Some(receiver) = receiver.as_mut() {
        if let Some(result) = receiver.recv().await {
            return result;
        }
    }
    std::future::pending().await
}

async fn retention_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable front door to a running [`RegistryDriver`]
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::Sender<RegistryCommand>,
    events: broadcast::Sender<CallListEvent>,
}

impl RegistryHandle {
    async fn send(&self, command: RegistryCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RegistryError::ChannelClosed)
    }

    pub async fn send_event(&self, event: TelephonyEvent) -> Result<()> {
        self.send(RegistryCommand::Telephony(event)).await
    }

    pub async fn post_classification(&self, result: ClassificationResult) -> Result<()> {
        self.send(RegistryCommand::Classification(result)).await
    }

    pub async fn dismiss_pending_disconnects(&self) -> Result<()> {
        self.send(RegistryCommand::DismissPendingDisconnects).await
    }

    pub async fn add_listener(&self, listener: Arc<dyn CallListListener>) -> Result<()> {
        self.send(RegistryCommand::AddListener(listener)).await
    }

    pub async fn remove_listener(&self, listener: Arc<dyn CallListListener>) -> Result<()> {
        self.send(RegistryCommand::RemoveListener(listener)).await
    }

    /// Run `f` on the owner task and return its result
    pub async fn with_registry<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut CallRegistry) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(RegistryCommand::WithRegistry(Box::new(move |registry| {
            if tx.send(f(registry)).is_err() {
                debug!("Caller went away before the registry closure finished");
            }
        })))
        .await?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallListEvent> {
        self.events.subscribe()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(RegistryCommand::Shutdown).await
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}
