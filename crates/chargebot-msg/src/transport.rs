//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Actuator port abstraction and in-memory implementation."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::types::PowerState;
use crate::{MessagingError, Result};

/// Port through which the controller switches the relay.
///
/// `set_power` resolves once the transport has accepted the command. It says
/// nothing about whether the device applied it.
#[async_trait]
pub trait ActuatorPort: Send + Sync {
    /// Request `state` on the relay listening on `topic`.
    async fn set_power(&self, topic: &str, state: PowerState) -> Result<()>;
    /// Human-readable actuator name for logging.
    fn name(&self) -> &'static str;
}

/// A command accepted by the [`InMemoryActuator`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    /// Target topic.
    pub topic: String,
    /// Requested state.
    pub state: PowerState,
    /// Runtime clock at acceptance; follows tokio's paused clock in tests.
    pub issued_at: Instant,
}

/// Actuator that records commands instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryActuator {
    commands: Arc<Mutex<Vec<CommandRecord>>>,
    failing: Arc<AtomicBool>,
    rejected: Arc<AtomicU64>,
}

impl InMemoryActuator {
    /// Create an empty actuator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent commands fail with [`MessagingError::Rejected`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Accepted commands in issue order.
    pub fn commands(&self) -> Vec<CommandRecord> {
        self.commands.lock().clone()
    }

    /// Accepted states in issue order.
    pub fn states(&self) -> Vec<PowerState> {
        self.commands.lock().iter().map(|record| record.state).collect()
    }

    /// Number of commands refused while failing.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActuatorPort for InMemoryActuator {
    async fn set_power(&self, topic: &str, state: PowerState) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(MessagingError::Rejected(self.name()));
        }
        self.commands.lock().push(CommandRecord {
            topic: topic.to_owned(),
            state,
            issued_at: Instant::now(),
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
