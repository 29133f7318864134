// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Job, JobProcessor};

/// Test double recording which jobs it was asked to process, and returning
/// whatever `anyhow::Result` the test queued up for that call index.
pub struct RecordingProcessor {
    pub seen: Mutex<Vec<u64>>,
    pub results: Mutex<Vec<anyhow::Result<()>>>,
    calls: AtomicUsize,
}

impl RecordingProcessor {
    pub fn new(results: Vec<anyhow::Result<()>>) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            results: Mutex::new(results),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl JobProcessor for RecordingProcessor {
    async fn process(&self, job: Job) -> anyhow::Result<()> {
        self.seen.lock().await.push(job.id);
        let idx = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut results = self.results.lock().await;
        if idx < results.len() {
            std::mem::replace(&mut results[idx], Ok(()))
        } else {
            Ok(())
        }
    }
}
