// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A FIFO, single-worker pile of jobs.
//!
//! The state machine collapses to one invariant -- at most one job runs,
//! and it is always the head of the pile -- enforced by a single background
//! task that owns the pile and drives each job's processor future to
//! completion before advancing. Completion is the processor's own
//! `Result<()>` return value: there is no separate one-shot callback to
//! call twice by mistake.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};

/// Payload carried by a job through its lifecycle.
#[derive(Clone, Debug, Default, Serialize)]
pub struct JobData {
    pub sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    pub owner: String,
    pub repo: String,
    pub force: bool,
    pub skip_post: bool,
    pub context: String,
    pub routine: Vec<String>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub coverage: Option<f64>,
}

impl JobData {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            owner: owner.into(),
            repo: repo.into(),
            force: true,
            ..Default::default()
        }
    }
}

/// A process bound to a running job. The Executor implements this over a
/// spawned script's child handle (or its process group, when the routine
/// asks for the whole tree to be killed on timeout).
#[async_trait]
pub trait BoundChild: Send {
    async fn kill(&mut self) -> anyhow::Result<()>;
}

/// A live job on the pile. Cloned handles share the same underlying data
/// and running flag; only the queue's own worker task ever sets `running`.
pub struct Job {
    pub id: u64,
    pub created: SystemTime,
    pub data: Arc<Mutex<JobData>>,
    running: Arc<RwLock<bool>>,
    child: Arc<Mutex<Option<Box<dyn BoundChild>>>>,
}

impl Clone for Job {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            created: self.created,
            data: Arc::clone(&self.data),
            running: Arc::clone(&self.running),
            child: Arc::clone(&self.child),
        }
    }
}

impl Job {
    fn new(id: u64, data: JobData) -> Self {
        Self {
            id,
            created: SystemTime::now(),
            data: Arc::new(Mutex::new(data)),
            running: Arc::new(RwLock::new(false)),
            child: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    async fn set_running(&self, value: bool) {
        *self.running.write().await = value;
    }

    pub async fn elapsed(&self) -> Duration {
        self.created.elapsed().unwrap_or_default()
    }

    /// Binds a child process to this job. Fails if the job is not running,
    /// or if a still-live child is already bound.
    pub async fn bind_child(&self, child: Box<dyn BoundChild>) -> anyhow::Result<()> {
        if !self.is_running().await {
            anyhow::bail!("cannot attach a child process to a job that is not running");
        }

        let mut slot = self.child.lock().await;
        if slot.is_some() {
            anyhow::bail!("job already has a live child process attached");
        }
        *slot = Some(child);
        Ok(())
    }

    pub async fn clear_child(&self) {
        *self.child.lock().await = None;
    }

    pub async fn kill_child(&self) -> anyhow::Result<()> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            child.kill().await?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobSnapshot {
    pub id: u64,
    pub running: bool,
    pub elapsed_secs: u64,
    pub data: JobData,
}

/// Outcome of a finished job, broadcast on the queue's event channel. Each
/// variant carries a snapshot of the job's data taken at completion time,
/// since by the time a subscriber's task runs the job may already have
/// been shifted off the pile.
#[derive(Clone, Debug)]
pub enum QueueEvent {
    Complete { job_id: u64, data: JobData },
    Error { job_id: u64, message: String, data: JobData },
    Finish { job_id: u64, error: Option<String>, data: JobData },
}

/// The user-supplied per-job routine. Its `Result` return value is the
/// sole completion signal -- there is no separate callback to forget to
/// call.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: Job) -> anyhow::Result<()>;
}

struct Pile {
    jobs: std::collections::VecDeque<Job>,
}

impl Pile {
    fn new() -> Self {
        Self {
            jobs: std::collections::VecDeque::new(),
        }
    }
}

pub struct Queue {
    pile: Arc<Mutex<Pile>>,
    processor: Arc<dyn JobProcessor>,
    events: broadcast::Sender<QueueEvent>,
}

impl Queue {
    pub fn new(processor: Arc<dyn JobProcessor>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            pile: Arc::new(Mutex::new(Pile::new())),
            processor,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Jobs currently on the pile sharing `sha`, in pile order.
    pub async fn jobs_for_sha(&self, sha: &str) -> Vec<Job> {
        let pile = self.pile.lock().await;
        let mut matches = Vec::new();
        for job in &pile.jobs {
            if job.data.lock().await.sha == sha {
                matches.push(job.clone());
            }
        }
        matches
    }

    pub async fn snapshot(&self) -> Vec<JobSnapshot> {
        let pile = self.pile.lock().await;
        let mut out = Vec::with_capacity(pile.jobs.len());
        for job in &pile.jobs {
            out.push(JobSnapshot {
                id: job.id,
                running: job.is_running().await,
                elapsed_secs: job.elapsed().await.as_secs(),
                data: job.data.lock().await.clone(),
            });
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.pile.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Synthesizes a job id, appends it to the pile, and kicks off
    /// processing asynchronously (the spawn below guarantees `add` returns
    /// to its caller before any `processFn` runs).
    pub async fn add(self: &Arc<Self>, data: JobData) -> Job {
        let job = {
            let mut pile = self.pile.lock().await;
            let id = next_job_id(&pile.jobs);
            let job = Job::new(id, data);
            pile.jobs.push_back(job.clone());
            log::info!("queued job {} (pile size = {})", id, pile.jobs.len());
            job
        };

        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.next().await });

        job
    }

    /// If the pile is non-empty and its head is idle, marks it running and
    /// drives its processor to completion. A no-op otherwise (including
    /// while the head is already running).
    async fn next(self: Arc<Self>) {
        let head = {
            let pile = self.pile.lock().await;
            pile.jobs.front().cloned()
        };

        let Some(head) = head else { return };

        if head.is_running().await {
            return;
        }

        head.set_running(true).await;

        let processor = Arc::clone(&self.processor);
        let queue = Arc::clone(&self);
        let job = head.clone();

        tokio::spawn(async move {
            let result = processor.process(job.clone()).await;
            queue.done(job, result).await;
        });
    }

    /// Runs the fixed event order: `complete`/`error`, then `finish`, then
    /// the pile shift, then the next job starts.
    async fn done(self: Arc<Self>, job: Job, result: anyhow::Result<()>) {
        job.set_running(false).await;

        let data = job.data.lock().await.clone();

        let error_message = match &result {
            Ok(()) => None,
            Err(err) => Some(err.to_string()),
        };

        let event = match &error_message {
            None => QueueEvent::Complete {
                job_id: job.id,
                data: data.clone(),
            },
            Some(message) => QueueEvent::Error {
                job_id: job.id,
                message: message.clone(),
                data: data.clone(),
            },
        };
        let _ = self.events.send(event);

        let _ = self.events.send(QueueEvent::Finish {
            job_id: job.id,
            error: error_message,
            data,
        });

        {
            let mut pile = self.pile.lock().await;
            if pile.jobs.front().map(|j| j.id) == Some(job.id) {
                pile.jobs.pop_front();
            }
        }

        self.next().await;
    }
}

fn next_job_id(existing: &std::collections::VecDeque<Job>) -> u64 {
    let seen: HashSet<u64> = existing.iter().map(|j| j.id).collect();

    loop {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
            % 10_000_000_000_000;
        let suffix: u64 = rand::thread_rng().gen_range(0..1000);
        let id = millis * 1000 + suffix;

        if !seen.contains(&id) {
            return id;
        }
    }
}

#[cfg(test)]
pub mod double;

#[cfg(test)]
mod tests;
