//! Single owner of the [`Coordinator`]. The management loop, the HTTP
//! callbacks and the webhook fast path all send commands here, so a cycle and
//! a completion callback never interleave.

use tokio::sync::{mpsc, oneshot};

use super::completion::{CompletionOutcome, CompletionReport};
use super::engine::{Coordinator, CyclePhase, CycleReport};
use crate::errors::GridError;

const CHANNEL_CAPACITY: usize = 64;

pub enum CoordinatorCommand {
    RunCycle {
        reply: oneshot::Sender<CycleReport>,
    },
    /// `reply` is `None` for fire-and-forget triggers such as webhooks.
    RunPhase {
        phase: CyclePhase,
        reply: Option<oneshot::Sender<CycleReport>>,
    },
    Complete {
        report: Box<CompletionReport>,
        reply: oneshot::Sender<Result<CompletionOutcome, GridError>>,
    },
    Cancel {
        execution_id: String,
        reply: oneshot::Sender<Result<CompletionOutcome, GridError>>,
    },
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    async fn send_command<T>(
        &self,
        command: CoordinatorCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, GridError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| GridError::CoordinatorStopped)?;
        rx.await.map_err(|_| GridError::CoordinatorStopped)
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, GridError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::RunCycle { reply }, rx)
            .await
    }

    pub async fn run_phase(&self, phase: CyclePhase) -> Result<CycleReport, GridError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::RunPhase {
                phase,
                reply: Some(reply),
            },
            rx,
        )
        .await
    }

    /// Queue a phase without waiting. Returns false when the queue is full,
    /// in which case the next timer tick covers it.
    pub fn enqueue_phase(&self, phase: CyclePhase) -> Result<bool, GridError> {
        match self
            .sender
            .try_send(CoordinatorCommand::RunPhase { phase, reply: None })
        {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GridError::CoordinatorStopped),
        }
    }

    pub async fn complete(&self, report: CompletionReport) -> Result<CompletionOutcome, GridError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::Complete {
                report: Box::new(report),
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn cancel(&self, execution_id: &str) -> Result<CompletionOutcome, GridError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::Cancel {
                execution_id: execution_id.to_string(),
                reply,
            },
            rx,
        )
        .await?
    }
}

async fn run_coordinator(mut rx: mpsc::Receiver<CoordinatorCommand>, coordinator: Coordinator) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            CoordinatorCommand::RunCycle { reply } => {
                let report = coordinator.run_cycle().await;
                let _ = reply.send(report);
            }
            CoordinatorCommand::RunPhase { phase, reply } => {
                tracing::debug!(phase = %phase, "running single phase");
                let report = coordinator.run_phase(phase).await;
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            CoordinatorCommand::Complete { report, reply } => {
                let result = coordinator.handle_completion(*report).await;
                let _ = reply.send(result);
            }
            CoordinatorCommand::Cancel { execution_id, reply } => {
                let result = coordinator.cancel_execution(&execution_id).await;
                let _ = reply.send(result);
            }
        }
    }
    tracing::info!("coordinator stopped");
}

/// A handle and the receiving end an actor drains.
pub fn coordinator_channel(
    capacity: usize,
) -> (CoordinatorHandle, mpsc::Receiver<CoordinatorCommand>) {
    let (tx, rx) = mpsc::channel(capacity);
    (CoordinatorHandle { sender: tx }, rx)
}

pub fn spawn_coordinator(
    coordinator: Coordinator,
) -> (CoordinatorHandle, tokio::task::JoinHandle<()>) {
    let (handle, rx) = coordinator_channel(CHANNEL_CAPACITY);
    let task_handle = tokio::spawn(run_coordinator(rx, coordinator));
    (handle, task_handle)
}
