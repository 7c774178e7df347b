//! End-to-end duration aggregation through the engine.

mod common;

use common::*;
use tally::core::config::DurationAggregation;
use tally::core::types::ConfigKey;
use tally::report::MetricReportData;
use tally::Engine;

fn duration_buckets(report: &tally::ConfigReport) -> Vec<(i64, i64, i64)> {
    let mut buckets: Vec<(i64, i64, i64)> = report
        .metrics
        .iter()
        .filter_map(|m| match &m.data {
            MetricReportData::Duration(data) => Some(data),
            _ => None,
        })
        .flatten()
        .flat_map(|d| d.buckets.iter())
        .map(|b| (b.bucket_start_ns, b.bucket_end_ns, b.duration_ns))
        .collect();
    buckets.sort_unstable();
    buckets
}

#[test]
fn duration_across_partial_bucket_split() {
    // 60-second buckets based at t=10s; acquire at 10s, app upgrade at
    // 25s, release at 135s. Expected buckets:
    // [10,25]=15s, [25,70]=45s, [70,130]=60s, and a [130,135]=5s partial.
    let mut engine = Engine::new(100, 0);
    let key = ConfigKey::new(1000, 1);
    engine
        .install_config(
            key,
            &wakelock_duration_config(DurationAggregation::Or),
            10 * NS_PER_SEC,
            0,
        )
        .unwrap();

    engine.process_event(&wakelock_event(10 * NS_PER_SEC, &[(111, "tag")], true));
    engine.notify_app_upgrade(25 * NS_PER_SEC);
    engine.process_event(&wakelock_event(135 * NS_PER_SEC, &[(111, "tag")], false));

    let report = engine
        .dump_report(key, 135 * NS_PER_SEC, true, true)
        .unwrap();
    assert_eq!(
        duration_buckets(&report),
        vec![
            (10 * NS_PER_SEC, 25 * NS_PER_SEC, 15 * NS_PER_SEC),
            (25 * NS_PER_SEC, 70 * NS_PER_SEC, 45 * NS_PER_SEC),
            (70 * NS_PER_SEC, 130 * NS_PER_SEC, 60 * NS_PER_SEC),
            (130 * NS_PER_SEC, 135 * NS_PER_SEC, 5 * NS_PER_SEC),
        ]
    );
}

#[test]
fn ord_duration_counts_overlap_once() {
    // Starts for uids A@10 and B@20, stops A@40 and B@60: the bucket
    // covering [10,60] reports the measure of the union, 50 seconds, not
    // the 50 + 40 the two intervals sum to.
    let mut engine = Engine::new(100, 0);
    let key = ConfigKey::new(1000, 1);
    engine
        .install_config(key, &wakelock_duration_config(DurationAggregation::Or), 0, 0)
        .unwrap();

    engine.process_event(&wakelock_event(10 * NS_PER_SEC, &[(111, "a")], true));
    engine.process_event(&wakelock_event(20 * NS_PER_SEC, &[(222, "b")], true));
    engine.process_event(&wakelock_event(40 * NS_PER_SEC, &[(111, "a")], false));
    engine.process_event(&wakelock_event(60 * NS_PER_SEC, &[(222, "b")], false));

    let report = engine
        .dump_report(key, 70 * NS_PER_SEC, true, true)
        .unwrap();
    assert_eq!(
        duration_buckets(&report),
        vec![(0, 60 * NS_PER_SEC, 50 * NS_PER_SEC)]
    );
}

#[test]
fn ord_duration_disjoint_intervals_sum() {
    // Disjoint intervals add up: [5,15] and [30,45] give 25 seconds.
    let mut engine = Engine::new(100, 0);
    let key = ConfigKey::new(1000, 1);
    engine
        .install_config(key, &wakelock_duration_config(DurationAggregation::Or), 0, 0)
        .unwrap();

    engine.process_event(&wakelock_event(5 * NS_PER_SEC, &[(111, "a")], true));
    engine.process_event(&wakelock_event(15 * NS_PER_SEC, &[(111, "a")], false));
    engine.process_event(&wakelock_event(30 * NS_PER_SEC, &[(222, "b")], true));
    engine.process_event(&wakelock_event(45 * NS_PER_SEC, &[(222, "b")], false));

    let report = engine
        .dump_report(key, 50 * NS_PER_SEC, true, true)
        .unwrap();
    assert_eq!(
        duration_buckets(&report),
        vec![(0, 50 * NS_PER_SEC, 25 * NS_PER_SEC)]
    );
}

#[test]
fn max_duration_reports_longest_finalized_interval() {
    // Wakelocks are sliced into separate trackers by the acquiring uid;
    // the longest finalized interval wins per dimension, and adding a
    // shorter one never reduces any report.
    let mut config = wakelock_duration_config(DurationAggregation::Max);
    config.duration_metrics[0].dimensions_in_what = Some(first_uid_dimensions());
    let mut engine = Engine::new(100, 0);
    let key = ConfigKey::new(1000, 1);
    engine.install_config(key, &config, 0, 0).unwrap();

    engine.process_event(&wakelock_event(10 * NS_PER_SEC, &[(111, "a")], true));
    engine.process_event(&wakelock_event(40 * NS_PER_SEC, &[(111, "a")], false)); // 30s
    engine.process_event(&wakelock_event(45 * NS_PER_SEC, &[(222, "b")], true));
    engine.process_event(&wakelock_event(50 * NS_PER_SEC, &[(222, "b")], false)); // 5s

    let report = engine
        .dump_report(key, 55 * NS_PER_SEC, true, true)
        .unwrap();
    let mut values: Vec<i64> = duration_buckets(&report)
        .iter()
        .map(|(_, _, d)| *d)
        .collect();
    values.sort_unstable();
    assert_eq!(values, vec![5 * NS_PER_SEC, 30 * NS_PER_SEC]);
}
