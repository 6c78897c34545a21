use crate::{Job, JobSpec, Priority, SourceImage};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

/// One priority tier. Retried jobs sit in `front` and are served before the
/// position-ordered section.
#[derive(Debug, Default)]
struct Tier {
    front: VecDeque<Job>,
    ordered: VecDeque<Job>,
}

impl Tier {
    fn len(&self) -> usize {
        self.front.len() + self.ordered.len()
    }

    fn pop(&mut self) -> Option<Job> {
        self.front.pop_front().or_else(|| self.ordered.pop_front())
    }

    fn insert_ordered(&mut self, job: Job) {
        let idx = self.ordered.partition_point(|j| j.position <= job.position);
        self.ordered.insert(idx, job);
    }

    fn remove(&mut self, position: u64) -> Option<Job> {
        if let Some(idx) = self.front.iter().position(|j| j.position == position) {
            return self.front.remove(idx);
        }
        let idx = self.ordered.iter().position(|j| j.position == position)?;
        self.ordered.remove(idx)
    }

    fn retain(&mut self, mut keep: impl FnMut(&Job) -> bool) {
        self.front.retain(&mut keep);
        self.ordered.retain(&mut keep);
    }

    fn iter(&self) -> impl Iterator<Item = &Job> {
        self.front.iter().chain(self.ordered.iter())
    }

    fn clear(&mut self) {
        self.front.clear();
        self.ordered.clear();
    }
}

/// What happened to a batch handed to [`JobQueue::enqueue`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueReport {
    pub accepted: usize,
    /// Already queued at a less urgent priority and moved up.
    pub promoted: usize,
    /// Already queued at the same or a more urgent priority.
    pub duplicates: usize,
    /// Refused because of the capacity ceiling.
    pub rejected: usize,
    /// Previously queued jobs dropped by overflow cleanup.
    pub discarded: usize,
    pub overflowed: bool,
}

/// Priority queue of pending generation jobs with a hard capacity ceiling.
///
/// Jobs are served critical first, then preload, then cache; within a tier
/// in ascending feed position, except that retried jobs jump to the front
/// of their tier.
#[derive(Debug)]
pub struct JobQueue {
    tiers: [Tier; 3],
    index: HashMap<u64, Priority>,
    capacity: usize,
    next_seq: u64,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            tiers: Default::default(),
            index: HashMap::new(),
            capacity,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(Tier::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, position: u64) -> bool {
        self.index.contains_key(&position)
    }

    pub fn priority_of(&self, position: u64) -> Option<Priority> {
        self.index.get(&position).copied()
    }

    /// Jobs in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.tiers.iter().flat_map(Tier::iter)
    }

    /// Stamps and inserts a batch. Once the ceiling is hit, overflow cleanup
    /// runs once and the rest of the batch is limited to critical jobs.
    pub fn enqueue(
        &mut self,
        specs: impl IntoIterator<Item = JobSpec>,
        source: &SourceImage,
    ) -> EnqueueReport {
        let mut report = EnqueueReport::default();

        for spec in specs {
            if let Some(existing) = self.priority_of(spec.position) {
                if spec.priority < existing {
                    if let Some(mut job) = self.remove(spec.position) {
                        debug!(position = job.position, from = %existing, to = %spec.priority, "Promoting queued job");
                        job.priority = spec.priority;
                        self.insert(job);
                        report.promoted += 1;
                    }
                } else {
                    report.duplicates += 1;
                }
                continue;
            }

            if self.len() >= self.capacity && !report.overflowed {
                report.discarded += self.overflow_cleanup();
                report.overflowed = true;
            }
            if (report.overflowed && spec.priority != Priority::Critical)
                || self.len() >= self.capacity
            {
                report.rejected += 1;
                continue;
            }

            let job = self.stamp(spec, source);
            self.insert(job);
            report.accepted += 1;
        }

        if report.overflowed {
            warn!(
                capacity = self.capacity,
                discarded = report.discarded,
                rejected = report.rejected,
                queue_len = self.len(),
                "Job queue overflow, non-critical work dropped"
            );
        }

        report
    }

    /// Puts a retried job back at the front of its tier. Returns `false` if
    /// the ceiling forced it out.
    pub fn requeue_front(&mut self, mut job: Job) -> bool {
        if let Some(existing) = self.remove(job.position) {
            job.priority = job.priority.min(existing.priority);
        }

        if self.len() >= self.capacity {
            let discarded = self.overflow_cleanup();
            warn!(
                capacity = self.capacity,
                discarded,
                "Job queue overflow while requeueing a retry"
            );
            if job.priority != Priority::Critical || self.len() >= self.capacity {
                return false;
            }
        }

        self.index.insert(job.position, job.priority);
        self.tiers[job.priority.tier()].front.push_front(job);
        true
    }

    /// Puts back jobs that were dequeued but not dispatched. Retried jobs go
    /// back to the front of their tier in their original order; fresh jobs
    /// return to their position slot.
    pub fn restore(&mut self, jobs: Vec<Job>) {
        for job in jobs.into_iter().rev() {
            if job.retry_count > 0 {
                self.index.insert(job.position, job.priority);
                self.tiers[job.priority.tier()].front.push_front(job);
            } else {
                self.insert(job);
            }
        }
    }

    /// Removes up to `n` jobs from the head of the queue.
    pub fn dequeue(&mut self, n: usize) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(n.min(self.len()));
        while jobs.len() < n {
            let Some(job) = self.tiers.iter_mut().find_map(Tier::pop) else {
                break;
            };
            self.index.remove(&job.position);
            jobs.push(job);
        }
        jobs
    }

    pub fn clear(&mut self) {
        for tier in &mut self.tiers {
            tier.clear();
        }
        self.index.clear();
    }

    fn stamp(&mut self, spec: JobSpec, source: &SourceImage) -> Job {
        let seq = self.next_seq;
        self.next_seq += 1;
        Job {
            id: Uuid::new_v4(),
            prompt: spec.prompt,
            priority: spec.priority,
            position: spec.position,
            source: source.clone(),
            retry_count: 0,
            enqueued_at: Utc::now(),
            seq,
        }
    }

    fn insert(&mut self, job: Job) {
        self.index.insert(job.position, job.priority);
        self.tiers[job.priority.tier()].insert_ordered(job);
    }

    fn remove(&mut self, position: u64) -> Option<Job> {
        let priority = self.index.remove(&position)?;
        self.tiers[priority.tier()].remove(position)
    }

    /// Drops every non-critical job, then trims critical jobs down to the
    /// newest half of the ceiling. Returns how many jobs were dropped.
    fn overflow_cleanup(&mut self) -> usize {
        let before = self.len();
        for tier in &mut self.tiers[1..] {
            tier.clear();
        }

        let half = self.capacity / 2;
        let critical = &mut self.tiers[Priority::Critical.tier()];
        if critical.len() > half {
            let mut seqs: Vec<u64> = critical.iter().map(|j| j.seq).collect();
            seqs.sort_unstable_by(|a, b| b.cmp(a));
            let oldest_kept = if half == 0 { u64::MAX } else { seqs[half - 1] };
            critical.retain(|j| j.seq >= oldest_kept);
        }

        self.index = self
            .tiers
            .iter()
            .flat_map(Tier::iter)
            .map(|j| (j.position, j.priority))
            .collect();

        before - self.len()
    }
}
