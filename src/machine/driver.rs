//! Tokio driver for the merge state machine.
//!
//! The machine core is synchronous and scheduler-agnostic; this driver
//! binds it to real time. It runs a `select!` loop over three sources:
//! - a `CancellationToken` for host shutdown,
//! - an mpsc control channel (`Suspend` / `Resume` / `Stop`),
//! - a sleep until the armed task's deadline.
//!
//! The machine never holds more than one armed task, so the driver tracks
//! at most one deadline. After every interaction with the machine the
//! deadline is re-synced from the armed entry: a new task id means a new
//! deadline, the same id keeps the one already computed.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::capability::slot::SlotControlCapability;
use crate::capability::snapshot::SnapshotMergeCapability;
use crate::capability::store::ProgressStore;
use crate::types::CompletionCode;

use super::machine::MergeStateMachine;
use super::task::TaskId;

/// Control messages accepted by a running driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineCommand {
    /// Suspend the machine; the pending task is disarmed.
    Suspend,
    /// Resume a suspended machine from the boot gate.
    Resume,
    /// Stop the machine and exit the driver loop.
    Stop,
}

/// Errors from the control handle.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The driver loop has exited.
    #[error("machine driver is no longer running")]
    Closed,
}

/// Handle for sending control messages to a running driver.
#[derive(Debug, Clone)]
pub struct MachineHandle {
    tx: mpsc::Sender<MachineCommand>,
}

impl MachineHandle {
    pub async fn suspend(&self) -> Result<(), CommandError> {
        self.send(MachineCommand::Suspend).await
    }

    pub async fn resume(&self) -> Result<(), CommandError> {
        self.send(MachineCommand::Resume).await
    }

    pub async fn stop(&self) -> Result<(), CommandError> {
        self.send(MachineCommand::Stop).await
    }

    async fn send(&self, command: MachineCommand) -> Result<(), CommandError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| CommandError::Closed)
    }
}

/// Drives a [`MergeStateMachine`] on the tokio runtime.
pub struct MachineDriver<S, B, P>
where
    S: SnapshotMergeCapability,
    B: SlotControlCapability,
    P: ProgressStore,
{
    machine: MergeStateMachine<S, B, P>,
    rx: mpsc::Receiver<MachineCommand>,
    shutdown: CancellationToken,
}

impl<S, B, P> MachineDriver<S, B, P>
where
    S: SnapshotMergeCapability,
    B: SlotControlCapability,
    P: ProgressStore,
{
    /// Wraps a machine, returning the driver and its control handle.
    pub fn new(
        machine: MergeStateMachine<S, B, P>,
        shutdown: CancellationToken,
    ) -> (Self, MachineHandle) {
        let (tx, rx) = mpsc::channel(16);
        (
            MachineDriver {
                machine,
                rx,
                shutdown,
            },
            MachineHandle { tx },
        )
    }

    /// Starts the machine and runs it to completion.
    ///
    /// Returns the terminal completion code, or `None` when the loop was
    /// stopped (shutdown token, `Stop` command, or all handles dropped)
    /// before the machine completed.
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Option<CompletionCode> {
        info!("merge cleanup driver started");
        self.machine.start();
        let mut deadline: Option<(TaskId, Instant)> = self.sync_deadline(None);

        loop {
            if let Some(code) = self.machine.completion_code() {
                info!(code = %code, "merge cleanup driver finished");
                return Some(code);
            }

            tokio::select! {
                // Host shutdown.
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested; stopping the merge cleanup machine");
                    self.machine.stop();
                    return self.machine.completion_code();
                }

                // Control messages.
                command = self.rx.recv() => {
                    match command {
                        Some(MachineCommand::Suspend) => {
                            debug!("suspend command received");
                            self.machine.suspend();
                        }
                        Some(MachineCommand::Resume) => {
                            debug!("resume command received");
                            self.machine.resume();
                        }
                        Some(MachineCommand::Stop) => {
                            info!("stop command received");
                            self.machine.stop();
                            return self.machine.completion_code();
                        }
                        None => {
                            // All handles dropped.
                            info!("control channel closed; stopping");
                            self.machine.stop();
                            return self.machine.completion_code();
                        }
                    }
                }

                // The armed task's deadline.
                _ = async {
                    match deadline {
                        Some((_, at)) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.machine.fire_scheduled();
                }
            }

            deadline = self.sync_deadline(deadline);
        }
    }

    /// Re-syncs the tracked deadline against the machine's armed task.
    ///
    /// Task ids are never reused, so an unchanged id means the deadline
    /// computed when the task was armed is still the right one.
    fn sync_deadline(&self, prev: Option<(TaskId, Instant)>) -> Option<(TaskId, Instant)> {
        let (id, _, delay) = self.machine.scheduled()?;
        match prev {
            Some((prev_id, at)) if prev_id == id => Some((prev_id, at)),
            _ => Some((id, Instant::now() + delay)),
        }
    }
}
