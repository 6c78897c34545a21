use crate::generation::{GenerationClient, GenerationError};
use crate::Job;
use async_channel::Receiver;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc::UnboundedSender, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

/// A job handed to a worker slot.
#[derive(Debug)]
pub struct Assignment {
    pub job: Job,
    /// Cache epoch at dispatch; results from an older epoch are discarded.
    pub epoch: u64,
    /// This call is the circuit breaker's recovery probe.
    pub probe: bool,
}

#[derive(Debug)]
pub enum WorkMessage {
    Started {
        slot: usize,
        job_id: Uuid,
    },
    Finished {
        slot: usize,
        assignment: Assignment,
        outcome: Result<String, GenerationError>,
        duration: Duration,
    },
}

/// Bookkeeping for one pool member. Only the coordinator mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSlot {
    pub id: usize,
    pub busy: bool,
    pub processed: u64,
    pub errors: u64,
    pub avg_duration: Duration,
}

impl WorkerSlot {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            busy: false,
            processed: 0,
            errors: 0,
            avg_duration: Duration::ZERO,
        }
    }

    /// Folds one finished call into the counters and running average.
    pub fn record(&mut self, duration: Duration, failed: bool) {
        self.processed += 1;
        if failed {
            self.errors += 1;
        }
        let n = u128::from(self.processed);
        let total = self.avg_duration.as_nanos() * (n - 1) + duration.as_nanos();
        self.avg_duration = Duration::from_nanos(u64::try_from(total / n).unwrap_or(u64::MAX));
    }

    pub fn reset_counters(&mut self) {
        self.processed = 0;
        self.errors = 0;
        self.avg_duration = Duration::ZERO;
    }
}

pub async fn start(
    slot: usize,
    cancel_token: CancellationToken,
    recv_from_queue: Receiver<Assignment>,
    send_to_server: UnboundedSender<WorkMessage>,
    client: Arc<dyn GenerationClient>,
    request_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            assignment = recv_from_queue.recv() => {
                let assignment = match assignment {
                    Ok(assignment) => assignment,
                    Err(_) => {
                        debug!("Job channel closed, worker exiting");
                        break;
                    }
                };

                let job_id = assignment.job.id;
                if send_to_server.send(WorkMessage::Started { slot, job_id }).is_err() {
                    break;
                }

                let started = Instant::now();
                let outcome = process(client.as_ref(), &assignment.job, request_timeout).await;
                let message = WorkMessage::Finished {
                    slot,
                    assignment,
                    outcome,
                    duration: started.elapsed(),
                };
                if send_to_server.send(message).is_err() {
                    break;
                }
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip_all, fields(job_id = %job.id, position = job.position, priority = %job.priority, retry = job.retry_count))]
async fn process(
    client: &dyn GenerationClient,
    job: &Job,
    request_timeout: Duration,
) -> Result<String, GenerationError> {
    let result = tokio::time::timeout(request_timeout, client.generate(&job.prompt, &job.source))
        .await
        .unwrap_or_else(|_| Err(GenerationError::Timeout(request_timeout)));

    match &result {
        Ok(_) => debug!("Generation succeeded"),
        Err(err) => debug!(error = %err, "Generation failed"),
    }
    result
}
