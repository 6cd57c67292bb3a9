//! End-to-end tick behaviour against an in-memory source and file sinks

mod common;

use common::{batch_ids, window_start, Harness};
use processor::pipeline::{LateCounts, TickOutcome};

fn committed(outcome: TickOutcome) -> processor::pipeline::TickStats {
    match outcome {
        TickOutcome::Committed(stats) => stats,
        other => panic!("expected a committed tick, got {:?}", other),
    }
}

#[tokio::test]
async fn test_kpis_of_a_closed_window() {
    let h = Harness::new("kpis");
    h.push(1, "France", "06:00:10", "ORDER", &[(5.0, 2)]);
    h.push(2, "France", "06:00:20", "RETURN", &[(3.0, 1)]);
    // Advances the watermark to 06:02:00, closing [06:00, 06:01)
    h.order(3, "Spain", "06:03:00");

    let mut engine = h.open().await;
    let stats = committed(engine.run_tick().await.unwrap());
    assert_eq!(stats.trigger_id, 1);
    assert_eq!(stats.records_read, 3);
    assert_eq!(stats.global_windows, 1);
    assert_eq!(stats.country_windows, 1);

    let global = h.global_rows();
    assert_eq!(global.len(), 1);
    assert_eq!(window_start(&global[0]), "2020-09-18T06:00:00Z");
    assert_eq!(global[0]["window"]["end"], "2020-09-18T06:01:00Z");
    assert_eq!(global[0]["OPM"], 2);
    assert_eq!(global[0]["total_sale_volume"], 7.0);
    assert_eq!(global[0]["average_transaction_size"], 3.5);
    assert_eq!(global[0]["rate_of_return"], 0.5);

    let country = h.country_rows();
    assert_eq!(country.len(), 1);
    assert_eq!(country[0]["country"], "France");
    assert_eq!(country[0]["OPM"], 2);
    assert_eq!(country[0]["total_sale_volume"], 7.0);

    // The 06:03 window stays open
    assert_eq!(engine.state().global.open_windows(), 1);
    assert_eq!(engine.state().last_committed_trigger_id, 1);
}

#[tokio::test]
async fn test_malformed_record_is_dropped() {
    let h = Harness::new("malformed");
    h.order(1, "France", "06:00:10");
    h.source.append(0, r#"{"invoice_no": 2, "country": "France", "type": "ORDER"}"#);
    h.source.append(0, "not json");
    h.order(3, "France", "06:00:30");

    let mut engine = h.open().await;
    let stats = committed(engine.run_tick().await.unwrap());

    assert_eq!(stats.records_read, 4);
    assert_eq!(stats.records_decoded, 2);
    assert_eq!(stats.decode_errors, 2);
    assert_eq!(engine.state().position, h.source.end_position());
    assert_eq!(engine.metrics().decode_errors_of("malformed"), 2);
    assert_eq!(engine.metrics().records_decoded.get(), 2);
}

#[tokio::test]
async fn test_late_events_fold_or_drop_by_watermark() {
    let h = Harness::new("late");
    let mut engine = h.open().await;

    h.order(1, "France", "06:03:00");
    committed(engine.run_tick().await.unwrap());
    assert_eq!(engine.state().watermark.current().to_string(), "Watermark(2020-09-18T06:02:00+00:00)");

    // [06:01, 06:02) has closed; [06:02, 06:03) still accepts
    h.order(2, "France", "06:01:59.999");
    h.order(3, "France", "06:02:00");
    let stats = committed(engine.run_tick().await.unwrap());
    // One closed-window event, counted once per aggregator
    let expected = LateCounts { folded: 1, dropped: 1 };
    assert_eq!(stats.global_late, expected);
    assert_eq!(stats.country_late, expected);
    assert_eq!(engine.metrics().late_dropped_for("global_kpi"), 1);
    assert_eq!(engine.metrics().late_dropped_for("country_kpi"), 1);

    h.order(4, "France", "06:05:00");
    committed(engine.run_tick().await.unwrap());

    let starts: Vec<String> = h.global_rows().iter().map(window_start).collect();
    assert_eq!(starts, vec!["2020-09-18T06:02:00Z", "2020-09-18T06:03:00Z"]);
    assert!(h.global_rows().iter().all(|row| row["OPM"] == 1));
}

#[tokio::test]
async fn test_tumbling_windows_cover_every_event_once() {
    let h = Harness::new("tumbling");
    let countries = ["France", "Spain", "EIRE"];
    for i in 0..120i64 {
        let second = (i * 37) % 600;
        let time = format!("06:{:02}:{:02}", second / 60, second % 60);
        h.order(i, countries[(i % 3) as usize], &time);
    }
    h.order(999, "France", "07:00:00");

    let mut engine = h.open().await;
    committed(engine.run_tick().await.unwrap());

    let global = h.global_rows();
    assert_eq!(global.len(), 10);
    let total: u64 = global.iter().map(|row| row["OPM"].as_u64().unwrap()).sum();
    assert_eq!(total, 120);

    let mut starts: Vec<String> = global.iter().map(window_start).collect();
    starts.dedup();
    assert_eq!(starts.len(), 10);
    for (minute, start) in starts.iter().enumerate() {
        assert_eq!(start, &format!("2020-09-18T06:{:02}:00Z", minute));
    }

    let country_total: u64 = h
        .country_rows()
        .iter()
        .map(|row| row["OPM"].as_u64().unwrap())
        .sum();
    assert_eq!(country_total, 120);
}

#[tokio::test]
async fn test_idle_tick_is_a_noop() {
    let h = Harness::new("noop");
    h.order(1, "France", "06:00:10");
    h.order(2, "France", "06:03:00");

    let mut engine = h.open().await;
    committed(engine.run_tick().await.unwrap());

    assert_eq!(engine.run_tick().await.unwrap(), TickOutcome::NoOp);
    assert_eq!(engine.next_trigger_id(), 2);
    assert_eq!(batch_ids(&h.config.sinks.global_kpi.path), vec![1]);
    assert_eq!(engine.metrics().ticks_with_outcome("noop"), 1);
}

#[tokio::test]
async fn test_empty_batch_leaves_no_output() {
    let h = Harness::new("empty_batches");
    h.order(1, "France", "06:00:10");

    let mut engine = h.open().await;
    let stats = committed(engine.run_tick().await.unwrap());
    assert_eq!(stats.global_windows, 0);

    // An empty batch leaves no directory behind
    assert_eq!(batch_ids(&h.config.sinks.global_kpi.path), Vec::<u64>::new());
    assert!(h.global_rows().is_empty());

    h.order(2, "France", "06:02:30");
    committed(engine.run_tick().await.unwrap());
    assert_eq!(batch_ids(&h.config.sinks.global_kpi.path), vec![2]);
}

#[tokio::test]
async fn test_open_requires_kpi_sinks() {
    let h = Harness::new("no_sinks");
    let err = h.open_with(h.router()).await.err().expect("open must fail");
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_max_events_per_tick_splits_input() {
    let mut h = Harness::new("max_events");
    h.config.trigger.max_events_per_tick = Some(2);
    for i in 0..5 {
        h.order(i, "France", "06:00:10");
    }

    let mut engine = h.open().await;
    let mut reads = Vec::new();
    loop {
        match engine.run_tick().await.unwrap() {
            TickOutcome::Committed(stats) => reads.push(stats.records_read),
            TickOutcome::NoOp => break,
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(reads, vec![2, 2, 1]);
    assert_eq!(engine.state().last_committed_trigger_id, 3);
}
