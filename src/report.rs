//! Serialized report model.
//!
//! A report wraps every metric's bucket vectors, the skipped buckets with
//! their typed drop reasons, and the data-corruption summary accumulated
//! since the last dump. Reports serialize through serde; the estimated
//! byte size lets callers budget transport payloads before encoding.

use crate::core::types::{BucketDropReason, ConfigKey, DataCorruptionReason};
use crate::event::{LogEvent, MetricDimensionKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropEvent {
    pub reason: BucketDropReason,
    pub drop_time_ns: i64,
}

/// A bucket window that produced no data, with the reasons why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedBucket {
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub drop_events: Vec<DropEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountBucketData {
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub count: i64,
    pub condition_true_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationBucketData {
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub duration_ns: i64,
    pub condition_true_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueBucketData {
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub value: f64,
    pub condition_true_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeBucketData {
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub atoms: Vec<LogEvent>,
}

/// Buckets for one dimension of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionData<T> {
    pub dimension: MetricDimensionKey,
    pub buckets: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricReportData {
    Count(Vec<DimensionData<CountBucketData>>),
    Duration(Vec<DimensionData<DurationBucketData>>),
    Event(Vec<LogEvent>),
    Value(Vec<DimensionData<ValueBucketData>>),
    Gauge(Vec<DimensionData<GaugeBucketData>>),
}

impl MetricReportData {
    /// Rough serialized size, for payload budgeting.
    pub fn estimated_bytes(&self) -> usize {
        const BUCKET_OVERHEAD: usize = 32;
        fn dims<T>(data: &[DimensionData<T>]) -> usize {
            data.iter()
                .map(|d| {
                    let key_size: usize = d
                        .dimension
                        .dimension_key_in_what()
                        .values()
                        .iter()
                        .chain(d.dimension.state_values_key().values())
                        .map(|fv| fv.size())
                        .sum();
                    key_size + d.buckets.len() * BUCKET_OVERHEAD
                })
                .sum()
        }
        match self {
            MetricReportData::Count(data) => dims(data),
            MetricReportData::Duration(data) => dims(data),
            MetricReportData::Value(data) => dims(data),
            MetricReportData::Event(events) => {
                events.iter().map(|e| e.size() + BUCKET_OVERHEAD).sum()
            }
            MetricReportData::Gauge(data) => data
                .iter()
                .map(|d| {
                    d.buckets
                        .iter()
                        .flat_map(|b| b.atoms.iter())
                        .map(|a| a.size() + BUCKET_OVERHEAD)
                        .sum::<usize>()
                })
                .sum(),
        }
    }
}

/// One metric's slice of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub metric_id: i64,
    pub data: MetricReportData,
    pub skipped_buckets: Vec<SkippedBucket>,
    pub estimated_data_bytes: usize,
}

/// A full on-demand report for one installed config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigReport {
    pub config_key: ConfigKey,
    pub current_report_elapsed_ns: i64,
    pub metrics: Vec<MetricReport>,
    /// Corruption observed since the last dump (unrecoverable reasons
    /// reappear in every report until the config is reset).
    pub data_corrupted_reasons: Vec<DataCorruptionReason>,
    pub estimated_bytes: usize,
}
