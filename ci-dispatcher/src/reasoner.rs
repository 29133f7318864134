// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Compares head vs base coverage records and decides the outcome of a
//! `coverage/*` check, enqueueing a base-commit job on demand when the base
//! record doesn't exist yet.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::{
    queue::{JobData, Queue},
    record::{RecordStore, Status},
};

pub struct CoverageReasoner {
    records: Arc<RecordStore>,
    queue: tokio::sync::OnceCell<Arc<Queue>>,
    strict_coverage: bool,
}

impl CoverageReasoner {
    pub fn new(records: Arc<RecordStore>, strict_coverage: bool) -> Self {
        Self {
            records,
            queue: tokio::sync::OnceCell::new(),
            strict_coverage,
        }
    }

    pub fn attach_queue(&self, queue: Arc<Queue>) {
        let _ = self.queue.set(queue);
    }

    fn queue(&self) -> &Arc<Queue> {
        self.queue.get().expect("reasoner used before attach_queue")
    }

    /// Requires `job.data.sha` and `job.data.base`; the caller is expected
    /// to have checked the context is a coverage check before calling.
    pub async fn compare_coverage(&self, job: &crate::queue::Job) -> Result<()> {
        let (sha, base, context, owner, repo) = {
            let data = job.data.lock().await;
            let base = data
                .base
                .clone()
                .context("compare_coverage requires job.data.base")?;
            (data.sha.clone(), base, data.context.clone(), data.owner.clone(), data.repo.clone())
        };

        let head_record = self.records.load_one(&sha).await?;
        let base_record = self.records.load_one(&base).await?;

        match (head_record, base_record) {
            (Some(head), Some(base_rec))
                if head.status == Status::Error || base_rec.status == Status::Error =>
            {
                let mut data = job.data.lock().await;
                data.status = Some(Status::Failure.as_str().to_string());
                data.description =
                    Some("Failed to determine coverage as tests incomplete due to errors".to_string());
            }
            (Some(head), Some(base_rec))
                if head.coverage.unwrap_or(0.0) > 0.0 && base_rec.coverage.unwrap_or(0.0) > 0.0 =>
            {
                let head_coverage = head.coverage.unwrap_or(0.0);
                let base_coverage = base_rec.coverage.unwrap_or(0.0);
                let delta = head_coverage - base_coverage;

                let passed = if self.strict_coverage { delta > 0.0 } else { delta >= 0.0 };

                let description = describe_delta(delta, base_coverage, head_coverage);

                let mut data = job.data.lock().await;
                data.status = Some(
                    if passed {
                        Status::Success
                    } else {
                        Status::Failure
                    }
                    .as_str()
                    .to_string(),
                );
                data.description = Some(description);
            }
            _ => {
                let base_data = JobData {
                    skip_post: true,
                    force: false,
                    ..JobData::new(owner.clone(), repo.clone(), base)
                };
                self.queue().add(base_data).await;

                let head_data = JobData {
                    skip_post: false,
                    force: false,
                    context,
                    ..JobData::new(owner, repo, sha.clone())
                };
                self.queue().add(head_data).await;

                job.data.lock().await.skip_post = true;
            }
        }

        Ok(())
    }
}

/// Renders the human-readable coverage delta description, rounding to
/// 0.01 and calling out small moves as "slightly".
fn describe_delta(delta: f64, base: f64, head: f64) -> String {
    let rounded_delta = (delta * 100.0).round() / 100.0;

    if rounded_delta == 0.0 {
        return format!("Coverage remains at {:.2}%", head);
    }

    let direction = if delta > 0.0 { "increased" } else { "decreased" };
    let slightly = if delta.abs() < 1.0 { " slightly" } else { "" };

    format!(
        "Coverage {}{} from {:.2}% to {:.2}%",
        direction, slightly, base, head
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobData;
    use crate::record::Record;
    use tempfile::tempdir;

    fn record(commit: &str, status: Status, coverage: Option<f64>) -> Record {
        Record {
            commit: commit.to_string(),
            status,
            description: String::new(),
            coverage,
            statistics: None,
            results: None,
            branch: None,
        }
    }

    #[test]
    fn delta_zero_reads_unchanged() {
        assert_eq!(describe_delta(0.0, 50.0, 50.0), "Coverage remains at 50.00%");
    }

    #[test]
    fn small_decrease_reads_slightly() {
        assert_eq!(
            describe_delta(-0.5, 50.5, 50.0),
            "Coverage decreased slightly from 50.50% to 50.00%"
        );
    }

    #[test]
    fn large_increase_has_no_slightly() {
        assert_eq!(
            describe_delta(10.0, 40.0, 50.0),
            "Coverage increased from 40.00% to 50.00%"
        );
    }

    #[tokio::test]
    async fn decrease_marks_failure() {
        let dir = tempdir().unwrap();
        let records = Arc::new(RecordStore::new(dir.path().join("db.json")));
        records
            .save(&[
                record("cabe27e5aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa71", Status::Success, Some(22.1969)),
                record("1c33a6e2aaaaaaaaaaaaaaaaaaaaaaaaaaaaaacf", Status::Success, Some(75.7702)),
            ])
            .await
            .unwrap();

        let reasoner = Arc::new(CoverageReasoner::new(Arc::clone(&records), false));
        let processor: Arc<dyn crate::queue::JobProcessor> = Arc::new(NullProcessor);
        let queue = Arc::new(Queue::new(processor));
        reasoner.attach_queue(Arc::clone(&queue));

        let mut data = JobData::new("o", "r", "cabe27e5aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa71");
        data.base = Some("1c33a6e2aaaaaaaaaaaaaaaaaaaaaaaaaaaaaacf".to_string());
        let job = queue.add(data).await;

        reasoner.compare_coverage(&job).await.unwrap();

        let data = job.data.lock().await;
        assert_eq!(data.status.as_deref(), Some("failure"));
        assert!(data.description.as_deref().unwrap().contains("decreased"));
    }

    #[tokio::test]
    async fn missing_base_enqueues_both_jobs() {
        let dir = tempdir().unwrap();
        let records = Arc::new(RecordStore::new(dir.path().join("db.json")));

        let reasoner = Arc::new(CoverageReasoner::new(Arc::clone(&records), false));
        // Blocks forever so the job under test stays at the pile head
        // while we inspect the two jobs the reasoner enqueues behind it.
        let processor: Arc<dyn crate::queue::JobProcessor> = Arc::new(BlockingProcessor);
        let queue = Arc::new(Queue::new(processor));
        reasoner.attach_queue(Arc::clone(&queue));

        let mut data = JobData::new("o", "r", "hf4ac7d00000000000000000000000000000000");
        data.base = Some("1c33a6e2aaaaaaaaaaaaaaaaaaaaaaaaaaaaaacf".to_string());
        data.context = "coverage".to_string();
        let job = queue.add(data).await;

        reasoner.compare_coverage(&job).await.unwrap();

        assert!(job.data.lock().await.skip_post);
        assert_eq!(queue.len().await, 3);

        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot[1].data.sha, "1c33a6e2aaaaaaaaaaaaaaaaaaaaaaaaaaaaaacf");
        assert!(!snapshot[2].data.skip_post);
        assert_eq!(snapshot[2].data.context, "coverage");
    }

    struct NullProcessor;

    #[async_trait::async_trait]
    impl crate::queue::JobProcessor for NullProcessor {
        async fn process(&self, _job: crate::queue::Job) -> Result<()> {
            Ok(())
        }
    }

    struct BlockingProcessor;

    #[async_trait::async_trait]
    impl crate::queue::JobProcessor for BlockingProcessor {
        async fn process(&self, _job: crate::queue::Job) -> Result<()> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(())
        }
    }
}
