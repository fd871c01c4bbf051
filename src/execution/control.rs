//! Execution Control
//!
//! Pause, resume, skip, debug and cancel requests reach a running engine as
//! messages on an unbounded channel. The engine drains the channel at every
//! step boundary and while a step is in flight, so a command sent before a
//! boundary always applies to the step after it.
//!
//! Each execution also exposes [`ControlFlags`], a snapshot of the control
//! state readable by observers. Senders record their intent immediately;
//! the engine clears flags as it consumes them.
//!
//! [`StateManager`] is the registry that maps execution ids to their
//! control handles, for callers that only know the id.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// A control message for a running execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    SkipCurrentStep,
    EnableDebug,
    DisableDebug,
    Cancel,
}

/// Observable control state of one execution.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlFlags {
    pub paused: bool,
    pub skip_requested: bool,
    pub debug_enabled: bool,
    pub cancel_requested: bool,
}

impl ControlFlags {
    fn record(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Pause => self.paused = true,
            ControlCommand::Resume => self.paused = false,
            ControlCommand::SkipCurrentStep => self.skip_requested = true,
            ControlCommand::EnableDebug => self.debug_enabled = true,
            ControlCommand::DisableDebug => self.debug_enabled = false,
            ControlCommand::Cancel => self.cancel_requested = true,
        }
    }
}

/// Cloneable handle used to steer one execution.
#[derive(Debug, Clone)]
pub struct ExecutionControl {
    execution_id: String,
    sender: UnboundedSender<ControlCommand>,
    flags: Arc<Mutex<ControlFlags>>,
}

impl ExecutionControl {
    /// Creates a handle and the receiving end the engine consumes.
    pub fn channel(execution_id: impl Into<String>) -> (Self, ControlReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let flags = Arc::new(Mutex::new(ControlFlags::default()));
        (
            Self {
                execution_id: execution_id.into(),
                sender,
                flags: Arc::clone(&flags),
            },
            ControlReceiver { receiver, flags },
        )
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Sends a command. Returns false if the execution has already finished.
    pub fn send(&self, command: ControlCommand) -> bool {
        self.flags.lock().record(command);
        match self.sender.send(command) {
            Ok(()) => {
                debug!("Execution '{}': sent {:?}", self.execution_id, command);
                true
            }
            Err(_) => {
                debug!(
                    "Execution '{}' no longer accepts commands ({:?} dropped)",
                    self.execution_id, command
                );
                false
            }
        }
    }

    pub fn pause(&self) -> bool {
        self.send(ControlCommand::Pause)
    }

    pub fn resume(&self) -> bool {
        self.send(ControlCommand::Resume)
    }

    /// Skips the next step to start. Consumed once.
    pub fn skip_current_step(&self) -> bool {
        self.send(ControlCommand::SkipCurrentStep)
    }

    pub fn enable_debug(&self) -> bool {
        self.send(ControlCommand::EnableDebug)
    }

    pub fn disable_debug(&self) -> bool {
        self.send(ControlCommand::DisableDebug)
    }

    pub fn cancel(&self) -> bool {
        self.send(ControlCommand::Cancel)
    }

    /// Returns the current control flags.
    pub fn flags(&self) -> ControlFlags {
        *self.flags.lock()
    }
}

/// Receiving end of an execution's control channel, owned by the engine.
#[derive(Debug)]
pub struct ControlReceiver {
    receiver: UnboundedReceiver<ControlCommand>,
    flags: Arc<Mutex<ControlFlags>>,
}

impl ControlReceiver {
    /// Waits for the next command.
    pub async fn recv(&mut self) -> Option<ControlCommand> {
        self.receiver.recv().await
    }

    /// Returns a pending command without waiting.
    pub fn try_recv(&mut self) -> Option<ControlCommand> {
        self.receiver.try_recv().ok()
    }

    /// Updates the observable flags from the engine side.
    pub fn update_flags(&self, update: impl FnOnce(&mut ControlFlags)) {
        update(&mut self.flags.lock());
    }
}

/// Registry of control handles for active executions.
#[derive(Debug, Default)]
pub struct StateManager {
    executions: RwLock<HashMap<String, ExecutionControl>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a control handle; the returned guard unregisters it on drop.
    pub fn register(self: &Arc<Self>, control: ExecutionControl) -> Registration {
        let execution_id = control.execution_id().to_string();
        self.executions
            .write()
            .insert(execution_id.clone(), control);
        debug!("Registered execution '{}'", execution_id);
        Registration {
            manager: Arc::clone(self),
            execution_id,
        }
    }

    /// Removes a handle.
    pub fn unregister(&self, execution_id: &str) {
        if self.executions.write().remove(execution_id).is_some() {
            debug!("Unregistered execution '{}'", execution_id);
        }
    }

    /// Gets the handle for an execution.
    pub fn get(&self, execution_id: &str) -> Option<ExecutionControl> {
        self.executions.read().get(execution_id).cloned()
    }

    /// Sends a command to an execution. Returns false if it is not active.
    pub fn send(&self, execution_id: &str, command: ControlCommand) -> bool {
        self.get(execution_id)
            .map_or(false, |control| control.send(command))
    }

    pub fn pause(&self, execution_id: &str) -> bool {
        self.send(execution_id, ControlCommand::Pause)
    }

    pub fn resume(&self, execution_id: &str) -> bool {
        self.send(execution_id, ControlCommand::Resume)
    }

    pub fn skip_current_step(&self, execution_id: &str) -> bool {
        self.send(execution_id, ControlCommand::SkipCurrentStep)
    }

    pub fn enable_debug(&self, execution_id: &str) -> bool {
        self.send(execution_id, ControlCommand::EnableDebug)
    }

    pub fn cancel(&self, execution_id: &str) -> bool {
        self.send(execution_id, ControlCommand::Cancel)
    }

    /// Returns the flags of an active execution.
    pub fn flags(&self, execution_id: &str) -> Option<ControlFlags> {
        self.get(execution_id).map(|control| control.flags())
    }

    /// Ids of all registered executions.
    pub fn active_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.executions.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Keeps an execution registered while alive.
#[derive(Debug)]
pub struct Registration {
    manager: Arc<StateManager>,
    execution_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.manager.unregister(&self.execution_id);
    }
}
