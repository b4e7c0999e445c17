//! In-process executor running each trial on a blocking worker thread.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{ExecutorEvent, TrialExecutor};
use crate::error::{ExecutorError, TrainableError};
use crate::trainable::{TrainableRegistry, TrialActor};
use crate::trial::{Trial, TrialConfig, TrialId};

const EVENT_BUFFER: usize = 1024;

enum Command {
    Step,
    Save {
        dir: PathBuf,
        reply: oneshot::Sender<Result<PathBuf, TrainableError>>,
    },
    Stop,
}

/// Runs trainables from a [`TrainableRegistry`] on `spawn_blocking` workers.
pub struct LocalExecutor {
    registry: Arc<TrainableRegistry>,
    workers: HashMap<TrialId, mpsc::UnboundedSender<Command>>,
    events_tx: mpsc::Sender<ExecutorEvent>,
    events_rx: mpsc::Receiver<ExecutorEvent>,
}

impl LocalExecutor {
    pub fn new(registry: TrainableRegistry) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            registry: Arc::new(registry),
            workers: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn registry(&self) -> &TrainableRegistry {
        &self.registry
    }

    /// Number of trials with a live worker.
    pub fn live_workers(&self) -> usize {
        self.workers.len()
    }

    fn send(&self, id: TrialId, command: Command) -> Result<(), ExecutorError> {
        let worker = self
            .workers
            .get(&id)
            .ok_or(ExecutorError::NotRunning { id })?;
        worker
            .send(command)
            .map_err(|_| ExecutorError::Disconnected { id })
    }
}

impl std::fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("registry", &self.registry)
            .field("live_workers", &self.workers.len())
            .finish()
    }
}

#[async_trait]
impl TrialExecutor for LocalExecutor {
    async fn start_trial(
        &mut self,
        trial: &Trial,
        checkpoint: Option<&Path>,
    ) -> Result<(), ExecutorError> {
        let id = trial.id;
        let trainable =
            self.registry
                .create(&trial.trainable)
                .ok_or_else(|| ExecutorError::UnknownTrainable {
                    name: trial.trainable.clone(),
                })?;
        let actor = TrialActor::new(id, trainable);
        let config = trial.config().clone();
        let restore_from = checkpoint.map(Path::to_path_buf);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let events = self.events_tx.clone();

        tokio::task::spawn_blocking(move || {
            let mut actor = actor;
            let prepared = catch_unwind(AssertUnwindSafe(|| {
                prepare(&mut actor, &config, restore_from.as_deref())
            }))
            .unwrap_or_else(|panic| Err(TrainableError::new(panic_message(panic.as_ref()))));
            let ok = prepared.is_ok();
            if ready_tx.send(prepared).is_err() || !ok {
                return;
            }
            worker_loop(id, actor, commands_rx, events);
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(ExecutorError::Setup {
                    id,
                    message: err.message,
                });
            }
            Err(_) => return Err(ExecutorError::Disconnected { id }),
        }

        commands_tx
            .send(Command::Step)
            .map_err(|_| ExecutorError::Disconnected { id })?;
        self.workers.insert(id, commands_tx);
        debug!(trial_id = %id, restored = checkpoint.is_some(), "Worker started");
        Ok(())
    }

    async fn continue_trial(&mut self, id: TrialId) -> Result<(), ExecutorError> {
        self.send(id, Command::Step)
    }

    async fn save_trial(&mut self, id: TrialId, dir: &Path) -> Result<PathBuf, ExecutorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(
            id,
            Command::Save {
                dir: dir.to_path_buf(),
                reply: reply_tx,
            },
        )?;
        match reply_rx.await {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(err)) => Err(ExecutorError::Checkpoint {
                id,
                message: err.message,
            }),
            Err(_) => Err(ExecutorError::Disconnected { id }),
        }
    }

    async fn stop_trial(&mut self, id: TrialId) -> Result<(), ExecutorError> {
        let worker = self
            .workers
            .remove(&id)
            .ok_or(ExecutorError::NotRunning { id })?;
        // The worker may already be gone after an error event.
        let _ = worker.send(Command::Stop);
        debug!(trial_id = %id, "Worker stopped");
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ExecutorEvent> {
        if self.workers.is_empty() {
            return self.events_rx.try_recv().ok();
        }
        self.events_rx.recv().await
    }
}

fn prepare(
    actor: &mut TrialActor,
    config: &TrialConfig,
    restore_from: Option<&Path>,
) -> Result<(), TrainableError> {
    actor.setup(config)?;
    if let Some(path) = restore_from {
        actor.restore(path)?;
    }
    Ok(())
}

fn worker_loop(
    id: TrialId,
    mut actor: TrialActor,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<ExecutorEvent>,
) {
    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Step => {
                let event = match catch_unwind(AssertUnwindSafe(|| actor.step())) {
                    Ok(Ok(fields)) => ExecutorEvent::Result {
                        trial_id: id,
                        fields,
                    },
                    Ok(Err(err)) => ExecutorEvent::Error {
                        trial_id: id,
                        message: err.message,
                    },
                    Err(panic) => ExecutorEvent::Error {
                        trial_id: id,
                        message: format!("train_step panicked: {}", panic_message(panic.as_ref())),
                    },
                };
                let failed = matches!(event, ExecutorEvent::Error { .. });
                if events.blocking_send(event).is_err() || failed {
                    return;
                }
            }
            Command::Save { dir, reply } => {
                let saved = catch_unwind(AssertUnwindSafe(|| actor.save(&dir))).unwrap_or_else(
                    |panic| Err(TrainableError::new(panic_message(panic.as_ref()))),
                );
                let _ = reply.send(saved);
            }
            Command::Stop => return,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
