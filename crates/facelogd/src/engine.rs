use chrono::{DateTime, Utc};
use facelog_core::trainer::TrainError;
use facelog_core::{ArtifactStore, Trainer, TrainingReport};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("training job {0} is already running")]
    AlreadyRunning(Uuid),
    #[error(transparent)]
    Train(#[from] TrainError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Lifecycle of the most recent training job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrainingState {
    Idle,
    Running {
        job_id: Uuid,
        started_at: DateTime<Utc>,
    },
    Succeeded {
        job_id: Uuid,
        finished_at: DateTime<Utc>,
        #[serde(flatten)]
        report: TrainingReport,
    },
    Failed {
        job_id: Uuid,
        finished_at: DateTime<Utc>,
        error: String,
    },
}

/// What `start` hands back.
#[derive(Debug)]
pub enum TrainStart {
    /// Job queued; poll `status` for the outcome.
    Started(Uuid),
    /// Job ran to completion before returning.
    Completed(Uuid, TrainingReport),
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Train {
        job_id: Uuid,
        reply: Option<oneshot::Sender<Result<TrainingReport, TrainError>>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    state: Arc<Mutex<TrainingState>>,
}

impl EngineHandle {
    /// Start a training job. With `wait`, resolve only once it has finished.
    pub async fn start(&self, wait: bool) -> Result<TrainStart, EngineError> {
        let job_id = Uuid::new_v4();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let TrainingState::Running { job_id: running, .. } = *state {
                return Err(EngineError::AlreadyRunning(running));
            }
            *state = TrainingState::Running {
                job_id,
                started_at: Utc::now(),
            };
        }

        let (reply_tx, reply_rx) = if wait {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        if self
            .tx
            .send(EngineRequest::Train {
                job_id,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            self.finish(job_id, Err("engine thread exited".into()));
            return Err(EngineError::ChannelClosed);
        }
        tracing::info!(%job_id, wait, "training job queued");

        match reply_rx {
            None => Ok(TrainStart::Started(job_id)),
            Some(rx) => {
                let report = rx.await.map_err(|_| EngineError::ChannelClosed)??;
                Ok(TrainStart::Completed(job_id, report))
            }
        }
    }

    pub fn status(&self) -> TrainingState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn finish(&self, job_id: Uuid, outcome: Result<TrainingReport, String>) {
        record_outcome(&self.state, job_id, outcome);
    }
}

fn record_outcome(
    state: &Mutex<TrainingState>,
    job_id: Uuid,
    outcome: Result<TrainingReport, String>,
) {
    let finished_at = Utc::now();
    *state.lock().unwrap_or_else(PoisonError::into_inner) = match outcome {
        Ok(report) => TrainingState::Succeeded {
            job_id,
            finished_at,
            report,
        },
        Err(error) => TrainingState::Failed {
            job_id,
            finished_at,
            error,
        },
    };
}

/// Spawn the training engine on a dedicated OS thread.
///
/// The thread owns the trainer (and with it the detector session), so jobs
/// run one at a time and never block the async runtime.
pub fn spawn_engine(
    mut trainer: Trainer,
    capture_root: PathBuf,
    artifacts: Arc<ArtifactStore>,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let state = Arc::new(Mutex::new(TrainingState::Idle));
    let thread_state = state.clone();

    std::thread::Builder::new()
        .name("facelog-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Train { job_id, reply } => {
                        let result = trainer
                            .train_and_publish(&capture_root, &artifacts)
                            .map(|(artifact, report)| {
                                tracing::info!(
                                    %job_id,
                                    trained_at = %artifact.trained_at,
                                    total_ids = report.total_ids,
                                    "training job succeeded"
                                );
                                report
                            });
                        if let Err(e) = &result {
                            tracing::warn!(%job_id, error = %e, "training job failed");
                        }

                        record_outcome(
                            &thread_state,
                            job_id,
                            result.as_ref().cloned().map_err(ToString::to_string),
                        );
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, state })
}
