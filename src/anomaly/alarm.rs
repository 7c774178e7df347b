//! Wall-clock alarms: the monitor ordering them and the periodic tracker.

use crate::core::config::{Alarm, Subscription};
use crate::core::types::ConfigKey;
use crate::event::MetricDimensionKey;
use crate::subscriber::{should_inform, trigger_subscribers, SubscriberDispatcher};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const MS_PER_SEC: i64 = 1000;
pub(crate) const NS_PER_SEC: i64 = 1_000_000_000;

/// One registered firing instant. Ids keep alarms with equal timestamps
/// distinct in the ordered set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InternalAlarm {
    pub timestamp_sec: i64,
    pub id: u64,
}

/// Holds pending alarms in firing order and hands out the fired set when
/// the wall clock passes them.
#[derive(Debug, Default)]
pub struct AlarmMonitor {
    next_id: AtomicU64,
    alarms: Mutex<BTreeSet<InternalAlarm>>,
}

impl AlarmMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an alarm at the given wall-clock second.
    pub fn add(&self, timestamp_sec: i64) -> InternalAlarm {
        let alarm = InternalAlarm {
            timestamp_sec,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        self.alarms.lock().insert(alarm);
        alarm
    }

    pub fn remove(&self, alarm: &InternalAlarm) {
        self.alarms.lock().remove(alarm);
    }

    /// Removes and returns every alarm due at or before `timestamp_sec`.
    pub fn pop_sooner_or_same(&self, timestamp_sec: i64) -> HashSet<InternalAlarm> {
        let mut alarms = self.alarms.lock();
        let mut fired = HashSet::new();
        while let Some(first) = alarms.iter().next().copied() {
            if first.timestamp_sec > timestamp_sec {
                break;
            }
            alarms.remove(&first);
            fired.insert(first);
        }
        fired
    }

    /// The next pending firing second, if any.
    pub fn next_alarm_sec(&self) -> Option<i64> {
        self.alarms.lock().iter().next().map(|a| a.timestamp_sec)
    }

    pub fn len(&self) -> usize {
        self.alarms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.lock().is_empty()
    }
}

/// Periodic wall-clock alarm with probabilistic subscriber notification.
#[derive(Debug)]
pub struct AlarmTracker {
    alarm_config: Alarm,
    config_key: ConfigKey,
    alarm_sec: i64,
    internal_alarm: Option<InternalAlarm>,
    subscriptions: Vec<Subscription>,
}

impl AlarmTracker {
    /// Computes the first firing instant at or after `current_millis` from
    /// the configured offset and period, and registers it.
    pub fn new(
        start_millis: i64,
        current_millis: i64,
        alarm: Alarm,
        config_key: ConfigKey,
        monitor: &AlarmMonitor,
    ) -> Self {
        let mut tracker = Self {
            alarm_sec: (start_millis + alarm.offset_millis) / MS_PER_SEC,
            alarm_config: alarm,
            config_key,
            internal_alarm: None,
            subscriptions: Vec::new(),
        };
        tracker.alarm_sec = tracker.find_next_alarm_sec(current_millis / MS_PER_SEC);
        tracker.internal_alarm = Some(monitor.add(tracker.alarm_sec));
        debug!(alarm_sec = tracker.alarm_sec, "periodic alarm scheduled");
        tracker
    }

    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn alarm_id(&self) -> i64 {
        self.alarm_config.id
    }

    pub fn alarm_sec(&self) -> i64 {
        self.alarm_sec
    }

    fn find_next_alarm_sec(&self, current_time_sec: i64) -> i64 {
        if current_time_sec < self.alarm_sec {
            return self.alarm_sec;
        }
        let periods_forward = ((current_time_sec - self.alarm_sec) * MS_PER_SEC)
            / self.alarm_config.period_millis
            + 1;
        self.alarm_sec + periods_forward * self.alarm_config.period_millis / MS_PER_SEC
    }

    /// Consumes a fired-alarm set. When this tracker's alarm is in it,
    /// subscribers are (probabilistically) informed and the alarm is
    /// rescheduled to the next period boundary strictly after the firing
    /// timestamp.
    pub fn inform_alarms_fired(
        &mut self,
        timestamp_ns: i64,
        fired: &mut HashSet<InternalAlarm>,
        monitor: &AlarmMonitor,
        dispatcher: &dyn SubscriberDispatcher,
    ) {
        let Some(current) = self.internal_alarm else {
            return;
        };
        if fired.is_empty() || !fired.contains(&current) {
            return;
        }

        if !self.subscriptions.is_empty()
            && should_inform(self.alarm_config.probability_of_informing)
        {
            trigger_subscribers(
                dispatcher,
                self.alarm_config.id,
                &MetricDimensionKey::default(),
                0,
                self.config_key,
                &self.subscriptions,
            );
        }

        fired.remove(&current);
        // Round the firing instant up to a whole second before advancing.
        self.alarm_sec = self.find_next_alarm_sec((timestamp_ns - 1) / NS_PER_SEC + 1);
        self.internal_alarm = Some(monitor.add(self.alarm_sec));
        debug!(alarm_sec = self.alarm_sec, "periodic alarm rescheduled");
    }

    /// Unregisters the pending alarm at teardown.
    pub fn unregister(&mut self, monitor: &AlarmMonitor) {
        if let Some(alarm) = self.internal_alarm.take() {
            monitor.remove(&alarm);
        }
    }
}
