//! Best-effort subscriber notification.

use crate::core::config::Subscription;
use crate::core::types::ConfigKey;
use crate::event::MetricDimensionKey;
use rand::Rng;
use tracing::debug;

/// Receives fire-and-forget broadcasts when an alert or alarm triggers.
/// Delivery is at-most-once; a failed send is dropped.
pub trait SubscriberDispatcher: Send + Sync {
    fn send_broadcast(
        &self,
        config_key: ConfigKey,
        subscription_id: i64,
        rule_id: i64,
        dimension_key: &MetricDimensionKey,
        metric_value: i64,
    ) -> bool;
}

/// Discards every broadcast; the default when no dispatcher is wired.
#[derive(Debug, Default)]
pub struct NoopDispatcher;

impl SubscriberDispatcher for NoopDispatcher {
    fn send_broadcast(
        &self,
        _config_key: ConfigKey,
        _subscription_id: i64,
        _rule_id: i64,
        _dimension_key: &MetricDimensionKey,
        _metric_value: i64,
    ) -> bool {
        true
    }
}

/// Rolls the probability gate. Values outside `[0, 1]` mean never/always;
/// they are intentionally not clamped, so -0.1 and 1.1 avoid the float
/// edge effects at exactly 0.0 and 1.0.
pub fn should_inform(probability: f32) -> bool {
    probability >= 1.0 || rand::thread_rng().gen::<f32>() < probability
}

/// Notifies every subscription bound to a rule, applying each
/// subscription's own probability gate.
pub fn trigger_subscribers(
    dispatcher: &dyn SubscriberDispatcher,
    rule_id: i64,
    dimension_key: &MetricDimensionKey,
    metric_value: i64,
    config_key: ConfigKey,
    subscriptions: &[Subscription],
) {
    for subscription in subscriptions {
        if !should_inform(subscription.probability_of_informing) {
            debug!(
                subscription_id = subscription.id,
                "subscription skipped by probability gate"
            );
            continue;
        }
        let delivered = dispatcher.send_broadcast(
            config_key,
            subscription.id,
            rule_id,
            dimension_key,
            metric_value,
        );
        if !delivered {
            debug!(
                subscription_id = subscription.id,
                rule_id, "subscriber broadcast dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RuleType;
    use parking_lot::Mutex;

    /// Records broadcasts for assertions.
    #[derive(Default)]
    pub struct RecordingDispatcher {
        pub broadcasts: Mutex<Vec<(i64, i64, i64)>>,
    }

    impl SubscriberDispatcher for RecordingDispatcher {
        fn send_broadcast(
            &self,
            _config_key: ConfigKey,
            subscription_id: i64,
            rule_id: i64,
            _dimension_key: &MetricDimensionKey,
            metric_value: i64,
        ) -> bool {
            self.broadcasts
                .lock()
                .push((subscription_id, rule_id, metric_value));
            true
        }
    }

    fn subscription(id: i64, probability: f32) -> Subscription {
        Subscription {
            id,
            rule_type: RuleType::Alert,
            rule_id: 7,
            subscriber_id: 100,
            probability_of_informing: probability,
        }
    }

    #[test]
    fn test_probability_edges() {
        // 1.1 always fires, -0.1 never does, regardless of rng.
        for _ in 0..100 {
            assert!(should_inform(1.1));
            assert!(!should_inform(-0.1));
        }
    }

    #[test]
    fn test_trigger_respects_per_subscription_probability() {
        let dispatcher = RecordingDispatcher::default();
        let subs = vec![subscription(1, 1.1), subscription(2, -0.1)];
        trigger_subscribers(
            &dispatcher,
            7,
            &MetricDimensionKey::default(),
            42,
            ConfigKey::new(0, 1),
            &subs,
        );
        let broadcasts = dispatcher.broadcasts.lock();
        assert_eq!(broadcasts.as_slice(), &[(1, 7, 42)]);
    }
}
