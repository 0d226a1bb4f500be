//! End-to-end scheduling scenarios.
//!
//! These tests run with tokio's paused clock so stage latencies are exact
//! and the timelines they assert on are deterministic.

use parking_lot::Mutex;
use stage_engine::{
    BoxError, JobEvent, JobOutcome, JobStatus, Pipeline, Scheduler, SchedulerConfig,
    StageContext, stage_fn,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mark {
    Start,
    End,
}

type Timeline = Arc<Mutex<Vec<(&'static str, Mark, u64)>>>;

/// Single-stage scheduler whose stage sleeps for the job's latency and logs
/// start/end times in milliseconds since `origin`.
fn timed_scheduler(
    ceiling: usize,
    timeline: Timeline,
    origin: Instant,
) -> Scheduler<(&'static str, u64), ()> {
    let pipeline = Pipeline::new().add_stage(stage_fn(
        "render",
        move |ctx: StageContext<(&'static str, u64), ()>| {
            let timeline = timeline.clone();
            async move {
                let (name, latency) = *ctx.input();
                let ms = || origin.elapsed().as_millis() as u64;
                timeline.lock().push((name, Mark::Start, ms()));
                tokio::time::sleep(Duration::from_millis(latency)).await;
                timeline.lock().push((name, Mark::End, ms()));
                Ok::<_, BoxError>(())
            }
        },
    ));
    Scheduler::new(SchedulerConfig::new("timed", ceiling), pipeline).unwrap()
}

fn time_of(timeline: &Timeline, name: &str, mark: Mark) -> u64 {
    timeline
        .lock()
        .iter()
        .find(|(n, m, _)| *n == name && *m == mark)
        .map(|(_, _, t)| *t)
        .unwrap_or_else(|| panic!("no {:?} recorded for {}", mark, name))
}

/// Single-stage scheduler whose jobs block until a permit is added to the
/// returned semaphore.
fn gated_scheduler(config: SchedulerConfig) -> (Scheduler<u32, u32>, Arc<Semaphore>) {
    let permits = Arc::new(Semaphore::new(0));
    let held = permits.clone();
    let pipeline = Pipeline::new().add_stage(stage_fn(
        "hold",
        move |ctx: StageContext<u32, u32>| {
            let permits = held.clone();
            async move {
                permits.acquire().await?.forget();
                Ok::<_, BoxError>(*ctx.input())
            }
        },
    ));
    (Scheduler::new(config, pipeline).unwrap(), permits)
}

/// Let spawned job tasks run until they block.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_ceiling_two_refills_slot_on_first_completion() {
    let timeline: Timeline = Arc::default();
    let origin = Instant::now();
    let scheduler = timed_scheduler(2, timeline.clone(), origin);

    let ids = scheduler.enqueue([("A", 10), ("B", 5), ("C", 1)]);
    let stats = scheduler.stats();
    assert_eq!(stats.running, 2);
    assert_eq!(stats.pending, 1);

    let outcomes = scheduler.wait_for(&ids).await;
    assert!(outcomes.iter().all(JobOutcome::is_success));

    assert_eq!(time_of(&timeline, "A", Mark::Start), 0);
    assert_eq!(time_of(&timeline, "B", Mark::Start), 0);
    assert_eq!(time_of(&timeline, "B", Mark::End), 5);
    assert_eq!(time_of(&timeline, "C", Mark::Start), 5);
    assert_eq!(time_of(&timeline, "C", Mark::End), 6);
    assert_eq!(time_of(&timeline, "A", Mark::End), 10);

    let stats = scheduler.stats();
    assert_eq!(stats.succeeded, 3);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_pause_before_admission_then_resume() {
    let (scheduler, permits) = gated_scheduler(SchedulerConfig::new("paused", 1).paused());

    let a = scheduler.enqueue_one(1);
    let b = scheduler.enqueue_one(2);
    settle().await;
    assert_eq!(scheduler.snapshot(a).unwrap().status, JobStatus::Pending);
    assert_eq!(scheduler.snapshot(b).unwrap().status, JobStatus::Pending);
    assert_eq!(scheduler.in_flight(), 0);

    scheduler.set_paused(false);
    assert!(scheduler.snapshot(a).unwrap().status.is_running());
    assert_eq!(scheduler.snapshot(b).unwrap().status, JobStatus::Pending);

    permits.add_permits(1);
    scheduler.wait_for(&[a]).await;
    assert!(scheduler.snapshot(b).unwrap().status.is_running());

    permits.add_permits(1);
    let outcomes = scheduler.wait_for(&[a, b]).await;
    assert!(outcomes.iter().all(JobOutcome::is_success));
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_pausing_leaves_running_jobs_alone() {
    let (scheduler, permits) = gated_scheduler(SchedulerConfig::new("pause", 1));
    let a = scheduler.enqueue_one(1);
    let b = scheduler.enqueue_one(2);

    scheduler.set_paused(true);
    permits.add_permits(2);
    let outcomes = scheduler.wait_for(&[a]).await;
    assert!(outcomes[0].is_success());

    settle().await;
    assert_eq!(scheduler.snapshot(b).unwrap().status, JobStatus::Pending);
    assert_eq!(scheduler.in_flight(), 0);

    scheduler.set_paused(false);
    assert!(scheduler.wait_for(&[b]).await[0].is_success());
}

#[tokio::test]
async fn test_failing_middle_stage_stops_job() {
    let third_calls = Arc::new(AtomicUsize::new(0));
    let calls = third_calls.clone();
    let pipeline = Pipeline::new()
        .add_stage(stage_fn("analyze", |_: StageContext<(), String>| async {
            Ok::<_, BoxError>("description".to_string())
        }))
        .add_stage(stage_fn("generate", |_: StageContext<(), String>| async {
            Err::<String, BoxError>("quota exceeded".into())
        }))
        .add_stage(stage_fn("compress", move |_: StageContext<(), String>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, BoxError>("thumbnail".to_string()) }
        }));
    let scheduler = Scheduler::new(SchedulerConfig::new("ingest", 6), pipeline).unwrap();

    let id = scheduler.enqueue_one(());
    let outcome = scheduler.wait_for(&[id]).await.remove(0);

    match outcome {
        JobOutcome::Failed { error, results, .. } => {
            assert_eq!(error.stage, "generate");
            assert_eq!(error.message, "quota exceeded");
            assert_eq!(results.stage_names(), vec!["analyze".to_string()]);
            assert_eq!(results.get("analyze").map(String::as_str), Some("description"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(third_calls.load(Ordering::SeqCst), 0);

    let snapshot = scheduler.snapshot(id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.stage_index, 1);
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_retry_restarts_full_sequence() {
    let calls: Arc<Mutex<Vec<(&'static str, u32)>>> = Arc::default();
    let first = calls.clone();
    let second = calls.clone();
    let pipeline = Pipeline::new()
        .add_stage(stage_fn("analyze", move |ctx: StageContext<(), u32>| {
            first.lock().push(("analyze", ctx.attempt()));
            async move { Ok::<_, BoxError>(ctx.attempt()) }
        }))
        .add_stage(stage_fn("generate", move |ctx: StageContext<(), u32>| {
            second.lock().push(("generate", ctx.attempt()));
            async move {
                if ctx.attempt() == 1 {
                    return Err::<u32, BoxError>("remote timeout".into());
                }
                Ok(ctx.output_of("analyze").copied().unwrap_or_default() * 10)
            }
        }));
    let scheduler = Scheduler::new(SchedulerConfig::new("retry", 2), pipeline).unwrap();

    let id = scheduler.enqueue_one(());
    assert!(!scheduler.wait_for(&[id]).await[0].is_success());

    let mut events = scheduler.subscribe();
    scheduler.retry(id).unwrap();

    let outcome = scheduler.wait_for(&[id]).await.remove(0);
    let JobOutcome::Succeeded { results, .. } = outcome else {
        panic!("retry should succeed");
    };
    // The second attempt re-ran analyze and generate saw its fresh output.
    assert_eq!(results.get("analyze"), Some(&2));
    assert_eq!(results.get("generate"), Some(&20));
    assert_eq!(
        *calls.lock(),
        vec![("analyze", 1), ("generate", 1), ("analyze", 2), ("generate", 2)]
    );

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let JobEvent::Updated(snapshot) = event {
            statuses.push(snapshot.status.to_string());
        }
    }
    assert_eq!(
        statuses,
        vec!["Pending", "Running(analyze)", "Running(generate)", "Succeeded"]
    );
    assert_eq!(scheduler.job(id).unwrap().attempt(), 2);
}

#[tokio::test]
async fn test_retry_of_running_job_is_rejected() {
    let (scheduler, permits) = gated_scheduler(SchedulerConfig::new("misuse", 1));
    let id = scheduler.enqueue_one(1);
    assert!(scheduler.retry(id).is_err());
    permits.add_permits(1);
    let outcome = scheduler.wait_for(&[id]).await;
    assert!(outcome[0].is_success());
    assert!(scheduler.retry(id).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_all_jobs_settle_with_bounded_concurrency() {
    const CEILING: usize = 6;
    const JOBS: u32 = 70;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (now, max) = (running.clone(), peak.clone());
    let pipeline = Pipeline::new()
        .add_stage(stage_fn("analyze", move |ctx: StageContext<u32, u32>| {
            let (now, max) = (now.clone(), max.clone());
            async move {
                let current = now.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(current, Ordering::SeqCst);
                let latency = (*ctx.input() as u64 * 7) % 13 + 1;
                tokio::time::sleep(Duration::from_millis(latency)).await;
                if *ctx.input() % 10 == 3 {
                    now.fetch_sub(1, Ordering::SeqCst);
                    return Err::<u32, BoxError>("unsupported image".into());
                }
                Ok(*ctx.input())
            }
        }))
        .add_stage(stage_fn("save", {
            let now = running.clone();
            move |ctx: StageContext<u32, u32>| {
                let now = now.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    now.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(*ctx.input())
                }
            }
        }));
    let scheduler = Scheduler::new(SchedulerConfig::new("liveness", CEILING), pipeline).unwrap();

    let observer = {
        let scheduler = scheduler.clone();
        let mut sink = scheduler.progress();
        tokio::spawn(async move {
            let mut checks = 0usize;
            while sink.changed().await.is_some() {
                let stats = scheduler.stats();
                assert_eq!(stats.running, stats.in_flight);
                assert!(stats.in_flight <= stats.ceiling);
                checks += 1;
                let summary = sink.summary();
                if summary.total == JOBS as usize && summary.is_settled() {
                    break;
                }
            }
            checks
        })
    };

    let ids = scheduler.enqueue(0..JOBS);
    let outcomes = scheduler.wait_for(&ids).await;

    assert_eq!(outcomes.len(), JOBS as usize);
    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    assert_eq!(failed, 7);
    assert!(peak.load(Ordering::SeqCst) <= CEILING);
    assert_eq!(peak.load(Ordering::SeqCst), CEILING);
    assert!(observer.await.unwrap() > 0);
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_admission_is_fifo() {
    let (scheduler, permits) = gated_scheduler(SchedulerConfig::new("fifo", 3).paused());
    let ids = scheduler.enqueue(0..5);

    scheduler.set_paused(false);
    let running: Vec<bool> = ids
        .iter()
        .map(|id| scheduler.snapshot(*id).unwrap().status.is_running())
        .collect();
    assert_eq!(running, vec![true, true, true, false, false]);

    permits.add_permits(5);
    scheduler.wait_for(&ids).await;
    let started: Vec<_> = ids
        .iter()
        .map(|id| scheduler.snapshot(*id).unwrap().started_at.unwrap())
        .collect();
    assert!(started.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_failures_release_their_slots() {
    let pipeline = Pipeline::new().add_stage(stage_fn("reject", |_: StageContext<u32, u32>| async {
        Err::<u32, BoxError>("bad request".into())
    }));
    let scheduler = Scheduler::new(SchedulerConfig::new("release", 2), pipeline).unwrap();

    let ids = scheduler.enqueue(0..10);
    let outcomes = scheduler.wait_for(&ids).await;
    assert!(outcomes.iter().all(|o| !o.is_success()));
    assert_eq!(scheduler.in_flight(), 0);

    // Retrying everything again never drives the counter below zero.
    assert_eq!(scheduler.retry_failed().len(), 10);
    scheduler.wait_for(&ids).await;
    scheduler.wait_idle().await;
    let stats = scheduler.stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.failed, 10);
}

#[tokio::test]
async fn test_clear_during_run_keeps_running_results() {
    let (scheduler, permits) = gated_scheduler(SchedulerConfig::new("clear", 2));
    let ids = scheduler.enqueue(0..5);

    assert_eq!(scheduler.clear(), 3);
    let mut sink = scheduler.progress();
    assert_eq!(sink.jobs().len(), 2);

    permits.add_permits(2);
    let outcomes = scheduler.wait_for(&ids).await;
    assert!(outcomes[0].is_success());
    assert!(outcomes[1].is_success());
    assert!(outcomes[2..]
        .iter()
        .all(|o| matches!(o, JobOutcome::Removed { .. })));

    sink.drain();
    assert_eq!(sink.summary().succeeded, 2);
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_reset_zeroes_in_flight_and_allows_reuse() {
    let pipeline = Pipeline::new().add_stage(stage_fn(
        "generate",
        |ctx: StageContext<u32, u32>| async move {
            tokio::select! {
                _ = ctx.cancellation().cancelled() => Err::<u32, BoxError>("cancelled".into()),
                _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(*ctx.input()),
            }
        },
    ));
    let scheduler = Scheduler::new(SchedulerConfig::new("session", 9), pipeline).unwrap();
    scheduler.enqueue(0..20);
    assert_eq!(scheduler.in_flight(), 9);

    scheduler.reset().await;
    assert_eq!(scheduler.in_flight(), 0);
    assert!(scheduler.is_empty());

    scheduler.set_paused(true);
    scheduler.reset().await;
    assert!(scheduler.is_paused());
}
