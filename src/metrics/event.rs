//! Event metric: records every matched event verbatim.

use super::{ProducerBase, ProducerBaseConfig};
use crate::core::types::ConditionState;
use crate::event::LogEvent;
use crate::report::{MetricReport, MetricReportData};

pub struct EventMetricProducer {
    base: ProducerBase,
    events: Vec<LogEvent>,
}

impl EventMetricProducer {
    pub(crate) fn new(config: ProducerBaseConfig) -> Self {
        Self {
            base: ProducerBase::new(config),
            events: Vec::new(),
        }
    }

    pub fn metric_id(&self) -> i64 {
        self.base.metric_id
    }

    pub(crate) fn base_mut(&mut self) -> &mut ProducerBase {
        &mut self.base
    }

    pub fn on_matched_log_event(&mut self, event: &LogEvent) {
        if self.base.condition_index.is_some() && !self.base.condition_met() {
            return;
        }
        self.events.push(event.clone());
    }

    pub fn on_condition_changed(&mut self, condition: ConditionState, _timestamp_ns: i64) {
        self.base.condition = condition;
    }

    pub fn on_dump_report(&mut self, erase_data: bool) -> MetricReport {
        let events = if erase_data {
            std::mem::take(&mut self.events)
        } else {
            self.events.clone()
        };
        let data = MetricReportData::Event(events);
        let estimated_data_bytes = data.estimated_bytes();
        MetricReport {
            metric_id: self.base.metric_id,
            data,
            skipped_buckets: self.base.take_skipped_buckets(),
            estimated_data_bytes,
        }
    }
}
