// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use super::double::RecordingProcessor;
use super::*;

async fn settle() {
    // Give the background `next()`/`done()` tasks a few scheduler turns.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn at_most_one_job_runs_and_it_is_the_head() {
    let processor = RecordingProcessor::new(vec![Ok(()), Ok(()), Ok(())]);
    let queue = Arc::new(Queue::new(processor.clone()));

    let j1 = queue.add(JobData::new("o", "r", "sha1")).await;
    let _j2 = queue.add(JobData::new("o", "r", "sha2")).await;
    let _j3 = queue.add(JobData::new("o", "r", "sha3")).await;

    // Immediately after adding, at most the head may be running.
    settle().await;

    let snapshot = queue.snapshot().await;
    let running: Vec<_> = snapshot.iter().filter(|j| j.running).collect();
    assert!(running.len() <= 1);
    if let Some(running) = running.first() {
        assert_eq!(running.id, snapshot[0].id);
    }

    assert_eq!(j1.id, snapshot[0].id);
}

#[tokio::test]
async fn jobs_drain_in_fifo_order() {
    let processor = RecordingProcessor::new(vec![Ok(()), Ok(())]);
    let queue = Arc::new(Queue::new(processor.clone()));

    let first = queue.add(JobData::new("o", "r", "sha1")).await;
    let second = queue.add(JobData::new("o", "r", "sha2")).await;

    for _ in 0..50 {
        settle().await;
        if queue.is_empty().await {
            break;
        }
    }

    assert!(queue.is_empty().await);
    let seen = processor.seen.lock().await.clone();
    assert_eq!(seen, vec![first.id, second.id]);
}

#[tokio::test]
async fn error_result_emits_error_then_finish() {
    let processor = RecordingProcessor::new(vec![Err(anyhow::anyhow!("boom"))]);
    let queue = Arc::new(Queue::new(processor));
    let mut events = queue.subscribe();

    let job = queue.add(JobData::new("o", "r", "sha1")).await;

    let first = events.recv().await.unwrap();
    let second = events.recv().await.unwrap();

    match first {
        QueueEvent::Error { job_id, message, data } => {
            assert_eq!(job_id, job.id);
            assert_eq!(message, "boom");
            assert_eq!(data.sha, "sha1");
        }
        other => panic!("expected Error, got {:?}", other),
    }

    match second {
        QueueEvent::Finish { job_id, error, .. } => {
            assert_eq!(job_id, job.id);
            assert_eq!(error.as_deref(), Some("boom"));
        }
        other => panic!("expected Finish, got {:?}", other),
    }
}

#[tokio::test]
async fn jobs_for_sha_finds_all_matches() {
    let processor = RecordingProcessor::new(vec![Ok(()), Ok(())]);
    let queue = Arc::new(Queue::new(processor));

    queue.add(JobData::new("o", "r", "deadbeef")).await;
    queue.add(JobData::new("o", "r", "deadbeef")).await;
    queue.add(JobData::new("o", "r", "other")).await;

    let matches = queue.jobs_for_sha("deadbeef").await;
    assert_eq!(matches.len(), 2);
}
