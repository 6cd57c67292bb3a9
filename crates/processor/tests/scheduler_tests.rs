//! Trigger scheduler lifecycle

mod common;

use common::{interval, Harness};
use processor::pipeline::{SchedulerState, TriggerScheduler};
use std::time::Duration;

#[tokio::test]
async fn test_run_until_shutdown() {
    let h = Harness::new("scheduler_run");
    h.order(1, "France", "06:00:10");
    h.order(2, "France", "06:03:00");

    let mut scheduler = TriggerScheduler::new(h.open().await, interval());
    let handle = scheduler.shutdown_handle();
    assert_eq!(handle.state(), SchedulerState::Idle);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
    });

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.committed, 1);
    assert_eq!(summary.aborted, 0);
    assert!(summary.noop >= 1);
    assert_eq!(summary.last_trigger_id, 1);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert_eq!(h.global_rows().len(), 1);
}

#[tokio::test]
async fn test_shutdown_before_start_runs_no_tick() {
    let h = Harness::new("scheduler_early_stop");
    h.order(1, "France", "06:00:10");

    let mut scheduler = TriggerScheduler::new(h.open().await, interval());
    scheduler.shutdown_handle().shutdown();

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.committed + summary.noop + summary.aborted, 0);
    assert_eq!(scheduler.engine().next_trigger_id(), 1);
}

#[tokio::test]
async fn test_fatal_error_stops_the_loop() {
    let mut h = Harness::new("scheduler_fatal");
    h.config.source.fail_on_data_loss = true;
    h.config.source.max_retries = 0;
    h.order(1, "France", "06:00:10");

    let mut scheduler = TriggerScheduler::new(h.open().await, interval());
    h.source.fail_next_reads(u32::MAX);

    let err = scheduler.run().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn test_run_once_tracks_summary() {
    let h = Harness::new("scheduler_once");
    h.order(1, "France", "06:00:10");

    let mut scheduler = TriggerScheduler::new(h.open().await, interval());
    scheduler.run_once().await.unwrap();
    scheduler.run_once().await.unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    let engine = scheduler.into_engine();
    assert_eq!(engine.state().last_committed_trigger_id, 1);
    assert_eq!(engine.metrics().ticks_with_outcome("committed"), 1);
    assert_eq!(engine.metrics().ticks_with_outcome("noop"), 1);
}
