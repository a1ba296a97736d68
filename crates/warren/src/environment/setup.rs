//! Bookkeeping for environment setups running in helper processes.
//!
//! A setup is complete once the helper has exited successfully *and* its
//! namespace descriptor has arrived. Either half failing marks the
//! environment failed.

use std::process::ExitStatus;

use warren_common::{WarrenError, WarrenResult};

use crate::exec;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    environment: String,
    child_pid: Option<u32>,
    socket_id: Option<u64>,
}

impl Pending {
    const fn is_done(&self) -> bool {
        self.child_pid.is_none() && self.socket_id.is_none()
    }
}

/// What an async event means for an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupEvent {
    /// The helper exited successfully.
    ChildSucceeded {
        /// Environment name.
        environment: String,
    },
    /// The helper failed, or the socket closed without a descriptor.
    Failed {
        /// Environment name.
        environment: String,
        /// Why.
        reason: String,
    },
    /// The namespace descriptor arrived.
    NamespaceReceived {
        /// Environment name.
        environment: String,
    },
}

/// The list of setups in flight, at most one per environment.
#[derive(Debug, Default)]
pub struct AsyncSetups {
    pending: Vec<Pending>,
}

impl AsyncSetups {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a setup for `environment` is in flight.
    #[must_use]
    pub fn in_progress(&self, environment: &str) -> bool {
        self.pending.iter().any(|p| p.environment == environment)
    }

    /// Number of setups in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Record a helper started for `environment`.
    pub fn begin(&mut self, environment: &str, child_pid: u32, socket_id: u64) -> WarrenResult<()> {
        if self.in_progress(environment) {
            return Err(WarrenError::SetupInProgress {
                name: environment.to_string(),
            });
        }

        tracing::debug!(environment, child_pid, socket_id, "Async setup started");
        self.pending.push(Pending {
            environment: environment.to_string(),
            child_pid: Some(child_pid),
            socket_id: Some(socket_id),
        });
        Ok(())
    }

    /// A child exited. Returns `None` for children we do not track.
    pub fn child_exited(&mut self, pid: u32, status: ExitStatus) -> Option<SetupEvent> {
        let index = self
            .pending
            .iter()
            .position(|p| p.child_pid == Some(pid))?;
        let pending = &mut self.pending[index];
        pending.child_pid = None;
        let environment = pending.environment.clone();

        let event = if exec::status_ok(status) {
            tracing::debug!(environment = %environment, "Setup process complete");
            SetupEvent::ChildSucceeded { environment }
        } else {
            let reason = format!("setup process {}", exec::describe_status(status));
            tracing::error!(environment = %environment, reason = %reason, "Setup failed");
            // No point waiting for the descriptor.
            pending.socket_id = None;
            SetupEvent::Failed {
                environment,
                reason,
            }
        };

        self.release(index);
        Some(event)
    }

    /// The namespace descriptor arrived on `socket_id`.
    pub fn fd_received(&mut self, socket_id: u64) -> Option<SetupEvent> {
        let index = self
            .pending
            .iter()
            .position(|p| p.socket_id == Some(socket_id))?;
        self.pending[index].socket_id = None;
        let environment = self.pending[index].environment.clone();
        self.release(index);
        Some(SetupEvent::NamespaceReceived { environment })
    }

    /// `socket_id` closed. If the descriptor never arrived, the setup failed.
    pub fn socket_closed(&mut self, socket_id: u64) -> Option<SetupEvent> {
        let index = self
            .pending
            .iter()
            .position(|p| p.socket_id == Some(socket_id))?;
        self.pending[index].socket_id = None;
        let environment = self.pending[index].environment.clone();
        self.release(index);
        Some(SetupEvent::Failed {
            environment,
            reason: "socket closed before the namespace arrived".to_string(),
        })
    }

    fn release(&mut self, index: usize) {
        if self.pending[index].is_done() {
            let done = self.pending.remove(index);
            tracing::debug!(environment = %done.environment, "Async setup finished");
        }
    }
}
