use crate::breaker::{Admission, CircuitBreaker};
use crate::buffer::{BufferMaintainer, BufferSnapshot};
use crate::cache::ImageCache;
use crate::config::SchedulerConfig;
use crate::generation::{self, FallbackReason, GenerationClient, GenerationError};
use crate::predictor::ScrollPredictor;
use crate::queue::JobQueue;
use crate::retry::RetryDecision;
use crate::stats::{CacheStats, QueueHealth, SystemHealth, WorkerStats};
use crate::worker::{self, Assignment, WorkMessage, WorkerSlot};
use crate::{GeneratedImage, Job, JobSpec, SourceImage};
use anyhow::Error;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::*;

/// Requests from [`crate::FeedScheduler`] handles.
#[derive(Debug)]
pub enum Command {
    Enqueue {
        jobs: Vec<JobSpec>,
        source: SourceImage,
    },
    UpdateScroll {
        index: u64,
        velocity: f64,
    },
    EnableContinuous(SourceImage),
    DisableContinuous,
    GetImage {
        position: u64,
        reply: oneshot::Sender<Option<GeneratedImage>>,
    },
    IsPreloaded {
        url: String,
        reply: oneshot::Sender<bool>,
    },
    WorkerStats {
        reply: oneshot::Sender<Vec<WorkerStats>>,
    },
    CacheStats {
        reply: oneshot::Sender<CacheStats>,
    },
    SystemHealth {
        reply: oneshot::Sender<SystemHealth>,
    },
    ClearAll,
}

/// Runs the coordinator until cancelled or every handle is dropped.
///
/// The coordinator is the only owner of queue, cache, breaker and slot
/// table. Workers only report outcomes back over a channel.
pub async fn serve(
    config: SchedulerConfig,
    client: Arc<dyn GenerationClient>,
    cancel_token: CancellationToken,
    mut recv_from_client: mpsc::UnboundedReceiver<Command>,
) -> Result<(), Error> {
    let workers_count = config.workers.size.max(1);
    let request_timeout = config.workers.request_timeout;

    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) = async_channel::bounded::<Assignment>(workers_count);

    let mut workers = vec![];
    for slot in 0..workers_count {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let client = client.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(
                    slot,
                    cancel_token,
                    recv_from_queue,
                    send_to_server,
                    client,
                    request_timeout,
                )
                .await;
            }
            .instrument(info_span!("worker", slot)),
        );
        workers.push(join_handle);
    }
    drop(send_to_server);

    let mut buffer_tick = time::interval(config.buffer.tick_interval);
    buffer_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut coordinator = Coordinator::new(config, workers_count, send_to_queue);

    info!(workers = workers_count, "Feed scheduler started");

    loop {
        coordinator.dispatch();

        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            chan_msg = recv_from_worker.recv() => {
                match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(msg) => coordinator.on_work_message(msg),
                }
            },
            chan_msg = recv_from_client.recv() => {
                match chan_msg {
                    None => {
                        debug!("All scheduler handles dropped, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(command) => coordinator.on_command(command),
                }
            },
            Some(expired) = coordinator.retries.next(), if !coordinator.retries.is_empty() => {
                coordinator.on_retry_due(expired.into_inner());
            },
            _ = buffer_tick.tick() => coordinator.on_buffer_tick(),
        }
    }

    coordinator.send_to_queue.close();

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}

struct Coordinator {
    config: SchedulerConfig,
    queue: JobQueue,
    cache: ImageCache,
    breaker: CircuitBreaker,
    slots: Vec<WorkerSlot>,
    predictor: ScrollPredictor,
    buffer: BufferMaintainer,
    retries: DelayQueue<Job>,
    retrying: HashSet<u64>,
    /// Position to job id for every dispatched, unfinished job.
    in_flight: HashMap<u64, uuid::Uuid>,
    /// Assignments sent to the pool that no worker has picked up yet.
    dispatched: usize,
    epoch: u64,
    scroll_position: u64,
    source: Option<SourceImage>,
    send_to_queue: async_channel::Sender<Assignment>,
}

impl Coordinator {
    fn new(
        config: SchedulerConfig,
        workers_count: usize,
        send_to_queue: async_channel::Sender<Assignment>,
    ) -> Self {
        Self {
            queue: JobQueue::new(config.queue.capacity),
            cache: ImageCache::new(config.cache.max_entries),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            slots: (0..workers_count).map(WorkerSlot::new).collect(),
            predictor: ScrollPredictor::new(config.predictor.clone()),
            buffer: BufferMaintainer::new(config.buffer.clone()),
            retries: DelayQueue::new(),
            retrying: HashSet::new(),
            in_flight: HashMap::new(),
            dispatched: 0,
            epoch: 0,
            scroll_position: 0,
            source: None,
            send_to_queue,
            config,
        }
    }

    fn idle_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.busy)
            .count()
            .saturating_sub(self.dispatched)
    }

    /// Fills every idle slot from the head of the queue.
    fn dispatch(&mut self) {
        let now = Instant::now();
        loop {
            let idle = self.idle_slots();
            if idle == 0 || self.queue.is_empty() {
                return;
            }

            let mut jobs = self.queue.dequeue(idle).into_iter();
            while let Some(job) = jobs.next() {
                let stalled = match self.breaker.admit(now) {
                    Admission::Allow => self.assign(job, false).err(),
                    Admission::Probe => self.assign(job, true).err(),
                    Admission::Reject => {
                        self.fallback(job, FallbackReason::CircuitOpen);
                        None
                    }
                    Admission::Hold => Some(job),
                };

                if let Some(job) = stalled {
                    let mut rest = vec![job];
                    rest.extend(jobs);
                    debug!(held = rest.len(), "Dispatch paused");
                    self.queue.restore(rest);
                    return;
                }
            }
        }
    }

    fn assign(&mut self, job: Job, probe: bool) -> Result<(), Job> {
        if self.in_flight.values().any(|id| *id == job.id) {
            error!(job_id = %job.id, position = job.position, "Job dispatched twice");
            debug_assert!(false, "job {} dispatched twice", job.id);
            return Ok(());
        }

        let (job_id, position) = (job.id, job.position);
        let assignment = Assignment {
            job,
            epoch: self.epoch,
            probe,
        };
        if let Err(err) = self.send_to_queue.try_send(assignment) {
            let assignment = err.into_inner();
            error!(job_id = %job_id, "Worker pool is not accepting jobs");
            if assignment.probe {
                self.breaker.abandon_probe();
            }
            return Err(assignment.job);
        }

        if let Some(previous) = self.in_flight.insert(position, job_id) {
            warn!(position, previous = %previous, "Position already in flight");
        }
        self.dispatched += 1;
        if probe {
            debug!(job_id = %job_id, position, "Circuit breaker probe dispatched");
        }
        Ok(())
    }

    fn on_work_message(&mut self, msg: WorkMessage) {
        match msg {
            WorkMessage::Started { slot, job_id } => {
                self.dispatched = self.dispatched.saturating_sub(1);
                if let Some(worker) = self.slots.get_mut(slot) {
                    if worker.busy {
                        error!(slot, "Worker slot picked up a job while busy");
                    }
                    debug_assert!(!worker.busy, "slot {slot} already busy");
                    worker.busy = true;
                }
                debug!(slot, job_id = %job_id, "Job started");
            }
            WorkMessage::Finished {
                slot,
                assignment,
                outcome,
                duration,
            } => self.on_finished(slot, assignment, outcome, duration),
        }
    }

    fn on_finished(
        &mut self,
        slot: usize,
        assignment: Assignment,
        outcome: Result<String, GenerationError>,
        duration: Duration,
    ) {
        let Assignment { job, epoch, probe } = assignment;
        if let Some(worker) = self.slots.get_mut(slot) {
            worker.busy = false;
            worker.record(duration, outcome.is_err());
        }
        self.breaker.record(outcome.is_ok(), probe, Instant::now());

        if epoch != self.epoch {
            debug!(job_id = %job.id, position = job.position, "Discarding result from before cache reset");
            return;
        }
        if self.in_flight.get(&job.position) == Some(&job.id) {
            self.in_flight.remove(&job.position);
        }

        match outcome {
            Ok(url) => {
                debug!(
                    job_id = %job.id,
                    position = job.position,
                    duration_ms = duration.as_millis() as u64,
                    "Generated image"
                );
                self.store(&job, url, false);
            }
            Err(err) => self.on_failure(job, err),
        }
    }

    fn on_failure(&mut self, mut job: Job, err: GenerationError) {
        job.retry_count += 1;
        match self.config.retry.decide(job.retry_count, self.breaker.state()) {
            RetryDecision::Retry(delay) => {
                warn!(
                    job_id = %job.id,
                    position = job.position,
                    retry = job.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Generation failed, retrying"
                );
                self.retrying.insert(job.position);
                self.retries.insert(job, delay);
            }
            RetryDecision::Fallback(reason) => {
                warn!(
                    job_id = %job.id,
                    position = job.position,
                    retry = job.retry_count,
                    reason = %reason,
                    error = %err,
                    "Generation failed, serving fallback"
                );
                self.fallback(job, reason);
            }
        }
    }

    fn on_retry_due(&mut self, job: Job) {
        self.retrying.remove(&job.position);
        let (job_id, position) = (job.id, job.position);
        if !self.queue.requeue_front(job) {
            warn!(job_id = %job_id, position, "Retry dropped by queue overflow");
        }
    }

    fn fallback(&mut self, job: Job, reason: FallbackReason) {
        debug!(job_id = %job.id, position = job.position, reason = %reason, "Serving fallback image");
        let url = generation::fallback_url(job.position, &job.prompt);
        self.store(&job, url, true);
    }

    fn store(&mut self, job: &Job, url: String, fallback: bool) {
        let image = GeneratedImage::from_job(job, url, fallback);
        let evicted = self.cache.put(image, self.scroll_position);
        if !evicted.is_empty() {
            debug!(
                evicted = evicted.len(),
                cached = self.cache.len(),
                "Cache trimmed around scroll position"
            );
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { jobs, source } => {
                self.source = Some(source.clone());
                self.enqueue(jobs, &source);
            }
            Command::UpdateScroll { index, velocity } => self.update_scroll(index, velocity),
            Command::EnableContinuous(source) => {
                info!(source = source.uri(), "Continuous generation enabled");
                self.source = Some(source.clone());
                self.buffer.enable(source);
                self.on_buffer_tick();
            }
            Command::DisableContinuous => {
                info!("Continuous generation disabled");
                self.buffer.disable();
            }
            Command::GetImage { position, reply } => {
                let _ = reply.send(self.cache.get(position).cloned());
            }
            Command::IsPreloaded { url, reply } => {
                let _ = reply.send(self.cache.is_preloaded(&url));
            }
            Command::WorkerStats { reply } => {
                let _ = reply.send(self.worker_stats());
            }
            Command::CacheStats { reply } => {
                let _ = reply.send(self.cache_stats());
            }
            Command::SystemHealth { reply } => {
                let _ = reply.send(self.system_health());
            }
            Command::ClearAll => self.clear_all(),
        }
    }

    /// Queues jobs, skipping positions that are already being generated.
    fn enqueue(&mut self, jobs: Vec<JobSpec>, source: &SourceImage) {
        let mut skipped = 0;
        let jobs: Vec<JobSpec> = jobs
            .into_iter()
            .filter(|spec| {
                let active = self.in_flight.contains_key(&spec.position)
                    || self.retrying.contains(&spec.position);
                if active {
                    skipped += 1;
                }
                !active
            })
            .collect();

        let report = self.queue.enqueue(jobs, source);
        debug!(
            accepted = report.accepted,
            promoted = report.promoted,
            duplicates = report.duplicates + skipped,
            rejected = report.rejected,
            queue_len = self.queue.len(),
            "Enqueued jobs"
        );
    }

    fn update_scroll(&mut self, index: u64, velocity: f64) {
        self.scroll_position = index;
        let cache = &self.cache;
        let prediction = self.predictor.update(index, velocity, |p| cache.contains(p));

        let Some(source) = self.source.clone() else {
            debug!(index, "No source image yet, skipping scroll prediction");
            return;
        };
        if !prediction.is_empty() {
            self.enqueue(prediction.into_jobs().collect(), &source);
        }
    }

    fn buffer_snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            scroll_position: self.scroll_position,
            cached: self.cache.len(),
            max_cached: self.cache.max_position(),
            queue_len: self.queue.len(),
            queue_capacity: self.queue.capacity(),
        }
    }

    fn on_buffer_tick(&mut self) {
        let Some(source) = self.buffer.source().cloned() else {
            return;
        };
        let snapshot = self.buffer_snapshot();
        let (cache, queue, in_flight, retrying) =
            (&self.cache, &self.queue, &self.in_flight, &self.retrying);
        let batch = self.buffer.tick(&snapshot, |p| {
            cache.contains(p)
                || queue.contains(p)
                || in_flight.contains_key(&p)
                || retrying.contains(&p)
        });
        if !batch.is_empty() {
            self.enqueue(batch, &source);
        }
    }

    fn worker_stats(&self) -> Vec<WorkerStats> {
        self.slots
            .iter()
            .map(|s| WorkerStats {
                id: s.id,
                busy: s.busy,
                processed: s.processed,
                errors: s.errors,
                avg_duration: s.avg_duration,
            })
            .collect()
    }

    fn cache_stats(&self) -> CacheStats {
        let total_workers = self.slots.len();
        // Assigned but not yet picked up counts as busy.
        let busy_workers = (self.slots.iter().filter(|s| s.busy).count() + self.dispatched)
            .min(total_workers);
        let efficiency = if total_workers == 0 {
            0.0
        } else {
            busy_workers as f64 / total_workers as f64 * 100.0
        };

        CacheStats {
            queue_length: self.queue.len(),
            processing: self.in_flight.len(),
            cached: self.cache.len(),
            preloaded: self.cache.preloaded_len(),
            busy_workers,
            total_workers,
            efficiency,
            buffer_health: self.buffer.health(self.cache.len()),
            distance_from_end: self.buffer_snapshot().distance_from_end(),
            continuous_enabled: self.buffer.is_enabled(),
        }
    }

    fn system_health(&self) -> SystemHealth {
        let now = Instant::now();
        let (recent_requests, recent_failures) = self.breaker.window_counts(now);
        SystemHealth {
            circuit_breaker_state: self.breaker.state(),
            queue_size: self.queue.len(),
            queue_health: QueueHealth::from_depth(self.queue.len(), self.queue.capacity()),
            api_failure_rate: self.breaker.failure_rate(now),
            recent_requests,
            recent_failures,
        }
    }

    /// Empties queue, cache, retries and in-flight bookkeeping. Results of
    /// jobs already running are discarded when they arrive.
    fn clear_all(&mut self) {
        self.epoch += 1;
        self.queue.clear();
        self.cache.clear();
        self.retries.clear();
        self.retrying.clear();
        self.in_flight.clear();
        self.buffer.reset();
        for slot in &mut self.slots {
            slot.reset_counters();
        }
        info!(epoch = self.epoch, "All caches cleared");
    }
}
