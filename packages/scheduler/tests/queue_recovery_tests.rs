//! Queue-level guarantees: crash recovery, concurrent-claim safety,
//! retry/event semantics, and the payload encryption round trip.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scheduler_core::testing::{EventRecorder, StaticEnvelopeCipher};
use scheduler_core::{
    CompletionOutcome, EventBus, HandlerRegistry, JobCompleted, JobProcessor, JobQueue, JobSpec,
    JobStatus, MemoryJobStore,
};

use common::{fast_processor_config, fast_queue_config, init_tracing, wait_until};

fn bare_queue() -> Arc<JobQueue> {
    init_tracing();
    Arc::new(
        JobQueue::new(Arc::new(MemoryJobStore::new()), EventBus::new())
            .with_config(fast_queue_config()),
    )
}

fn types(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_owner_is_reclaimed_and_the_job_retried() {
    let queue = bare_queue();
    let job = queue
        .enqueue(JobSpec::builder().job_type("t").max_retries(2).build())
        .await
        .unwrap();

    // Claim with a short lease, then "die": no finish, no heartbeat.
    let claimed = queue
        .claim_one(&types(&["t"]), 80)
        .await
        .unwrap()
        .expect("job should be claimable");
    assert_eq!(claimed.id, job.id);
    queue.start_job(job.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(queue.reclaim_orphans().await.unwrap(), 1);

    let row = queue.get(job.id).await.unwrap();
    assert_eq!(row.status, JobStatus::Pending);
    assert_eq!(row.attempt, 0, "reclaim must not burn an attempt");
    assert!(row.owner_instance_id.is_none());
    assert_eq!(row.last_error.as_deref(), Some("lease expired"));

    // The next claim picks it up again.
    let reclaimed = queue.claim_one(&types(&["t"]), 60_000).await.unwrap();
    assert_eq!(reclaimed.unwrap().id, job.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn one_job_ten_claimers_exactly_one_winner() {
    let queue = bare_queue();
    queue.enqueue(JobSpec::immediate("t")).await.unwrap();

    let mut claims = Vec::new();
    for _ in 0..10 {
        let queue = queue.clone();
        claims.push(tokio::spawn(async move {
            queue.claim_one(&types(&["t"]), 60_000).await.unwrap()
        }));
    }

    let mut winners = 0;
    for claim in claims {
        if claim.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one claimer may win the job");
}

#[tokio::test(flavor = "multi_thread")]
async fn every_job_is_executed_exactly_once_across_workers() {
    init_tracing();
    let bus = EventBus::new();
    let queue = Arc::new(
        JobQueue::new(Arc::new(MemoryJobStore::new()), bus).with_config(fast_queue_config()),
    );

    let invocations: Arc<Mutex<HashMap<uuid::Uuid, usize>>> = Arc::default();
    let sink = invocations.clone();
    let mut registry = HandlerRegistry::new();
    registry.register("fanout", move |ctx: scheduler_core::jobs::JobContext| {
        let sink = sink.clone();
        async move {
            *sink.lock().unwrap().entry(ctx.job_id).or_insert(0) += 1;
            Ok(None)
        }
    });
    let processor = JobProcessor::with_config(
        queue.clone(),
        Arc::new(registry),
        fast_processor_config(),
    );

    let mut ids = Vec::new();
    for i in 0..20 {
        let job = queue
            .enqueue(JobSpec::builder().job_type("fanout").priority(i % 3).build())
            .await
            .unwrap();
        ids.push(job.id);
    }

    processor.start();
    let check_queue = queue.clone();
    let check_ids = ids.clone();
    wait_until(Duration::from_secs(5), "all jobs to finish", || {
        let queue = check_queue.clone();
        let ids = check_ids.clone();
        async move {
            for id in &ids {
                if queue.get(*id).await.unwrap().status != JobStatus::Succeeded {
                    return false;
                }
            }
            true
        }
    })
    .await;
    processor.stop().await;

    let counts = invocations.lock().unwrap();
    assert_eq!(counts.len(), 20);
    assert!(
        counts.values().all(|&n| n == 1),
        "a job ran more than once without any lease expiry"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn encrypted_payload_reaches_the_handler_as_plaintext() {
    init_tracing();
    let bus = EventBus::new();
    let queue = Arc::new(
        JobQueue::new(Arc::new(MemoryJobStore::new()), bus)
            .with_config(fast_queue_config())
            .with_cipher(Arc::new(StaticEnvelopeCipher::new())),
    );

    let seen: Arc<Mutex<Option<Vec<u8>>>> = Arc::default();
    let sink = seen.clone();
    let mut registry = HandlerRegistry::new();
    registry.register("secret_work", move |ctx: scheduler_core::jobs::JobContext| {
        let sink = sink.clone();
        async move {
            *sink.lock().unwrap() = ctx.payload.clone();
            Ok(None)
        }
    });
    let processor = JobProcessor::with_config(
        queue.clone(),
        Arc::new(registry),
        fast_processor_config(),
    );

    let plaintext = br#"{"token":"swordfish"}"#.to_vec();
    let job = queue
        .enqueue(
            JobSpec::builder()
                .job_type("secret_work")
                .payload(Some(plaintext.clone()))
                .encrypt_payload(true)
                .build(),
        )
        .await
        .unwrap();

    // At rest the row holds an envelope, not the plaintext.
    assert!(job.payload_encrypted);
    assert_ne!(job.payload.as_ref(), Some(&plaintext));

    processor.start();
    let check_queue = queue.clone();
    wait_until(Duration::from_secs(3), "encrypted job to succeed", || {
        let queue = check_queue.clone();
        async move { queue.get(job.id).await.unwrap().status == JobStatus::Succeeded }
    })
    .await;
    processor.stop().await;

    assert_eq!(seen.lock().unwrap().as_ref(), Some(&plaintext));
}

#[tokio::test(flavor = "multi_thread")]
async fn retries_emit_a_single_terminal_completion_event() {
    init_tracing();
    let bus = EventBus::new();
    let queue = Arc::new(
        JobQueue::new(Arc::new(MemoryJobStore::new()), bus.clone())
            .with_config(fast_queue_config()),
    );
    let completed = EventRecorder::<JobCompleted>::attach(&bus);

    // Fails on the first attempt, succeeds on the retry.
    let mut registry = HandlerRegistry::new();
    registry.register("flaky_once", |ctx: scheduler_core::jobs::JobContext| async move {
        if ctx.attempt == 0 {
            anyhow::bail!("transient hiccup");
        }
        Ok(Some(serde_json::json!({ "attempt": ctx.attempt })))
    });
    let processor = JobProcessor::with_config(
        queue.clone(),
        Arc::new(registry),
        fast_processor_config(),
    );

    let job = queue
        .enqueue(JobSpec::builder().job_type("flaky_once").max_retries(1).build())
        .await
        .unwrap();

    processor.start();
    let check_queue = queue.clone();
    wait_until(Duration::from_secs(5), "retried job to succeed", || {
        let queue = check_queue.clone();
        async move { queue.get(job.id).await.unwrap().status == JobStatus::Succeeded }
    })
    .await;
    processor.stop().await;

    let row = queue.get(job.id).await.unwrap();
    assert_eq!(row.attempt, 1, "one retry consumed");
    assert_eq!(row.result, Some(serde_json::json!({ "attempt": 1 })));

    // Give the bus a beat, then: the intermediate failure emitted nothing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = completed.events();
    assert_eq!(events.len(), 1, "only the terminal outcome is published");
    assert_eq!(events[0].outcome, CompletionOutcome::Succeeded);
    assert_eq!(events[0].job_id, job.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn cooperative_cancellation_of_a_running_job() {
    init_tracing();
    let bus = EventBus::new();
    let queue = Arc::new(
        JobQueue::new(Arc::new(MemoryJobStore::new()), bus.clone())
            .with_config(fast_queue_config()),
    );
    let completed = EventRecorder::<JobCompleted>::attach(&bus);

    // A well-behaved handler: waits on its token, then reports cancelled.
    let mut registry = HandlerRegistry::new();
    registry.register("obedient", |ctx: scheduler_core::jobs::JobContext| async move {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        }
        ctx.cancel.ensure_active()?;
        Ok(None)
    });

    // Short lease so the heartbeat (lease / 3) refreshes the flag quickly.
    let mut config = fast_processor_config();
    config.lease_ms = 300;
    let processor = JobProcessor::with_config(queue.clone(), Arc::new(registry), config);

    let job = queue.enqueue(JobSpec::immediate("obedient")).await.unwrap();
    processor.start();

    let check_queue = queue.clone();
    wait_until(Duration::from_secs(3), "job to start running", || {
        let queue = check_queue.clone();
        async move { queue.get(job.id).await.unwrap().status == JobStatus::Running }
    })
    .await;

    queue.request_cancel(job.id).await.unwrap();

    let check_queue = queue.clone();
    wait_until(Duration::from_secs(3), "job to observe cancellation", || {
        let queue = check_queue.clone();
        async move { queue.get(job.id).await.unwrap().status == JobStatus::Cancelled }
    })
    .await;
    processor.stop().await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = completed.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, CompletionOutcome::Cancelled);
}
