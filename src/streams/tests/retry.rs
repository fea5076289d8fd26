//! Tests for the retry and reclaim processor

#[cfg(test)]
mod tests {
    use crate::streams::api::*;
    use crate::streams::entry::{
        FIELD_DELIVERY_COUNT, FIELD_EVENT_ID, FIELD_SOURCE_CHANNEL, FIELD_SOURCE_GROUP,
        FIELD_SOURCE_ID, FIELD_TYPE,
    };
    use crate::streams::memory::BrokerOp;
    use crate::streams::tests::support::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const DEAD_LETTER: &str = "stream:dead-letter";

    async fn setup(recorder: &Recorder) -> Harness {
        let registry = HandlerRegistry::build([recorder.binding(feed(), EVENT)]).unwrap();
        let harness = Harness::new(registry);
        harness.ensure_all().await;
        harness
    }

    /// Deliver `id` to a consumer that never acks, `deliveries` times in total
    async fn strand(harness: &Harness, deliveries: u64) {
        harness
            .broker
            .read_group(CHANNEL, GROUP, "crashed", 10, Duration::ZERO)
            .await
            .unwrap();
        let ids = harness.broker.pending_ids(CHANNEL, GROUP);
        for _ in 1..deliveries {
            harness
                .broker
                .claim(CHANNEL, GROUP, "crashed", Duration::ZERO, &ids)
                .await
                .unwrap();
        }
    }

    async fn age_past_min_idle() {
        tokio::time::advance(Duration::from_millis(1_001)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_delivery_is_redelivered_and_acked() {
        let recorder = Recorder::new();
        let harness = setup(&recorder).await;
        harness.append_event(EVENT, r#"{"id":1}"#).await;
        strand(&harness, 3).await;
        age_past_min_idle().await;

        let report = harness.retry_processor().sweep().await;

        assert_eq!(report.claimed, 1);
        assert_eq!(report.redelivered, 1);
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(recorder.count(), 1);
        assert!(harness.broker.pending_ids(CHANNEL, GROUP).is_empty());
        assert!(harness.broker.entries(DEAD_LETTER).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_delivery_is_dead_lettered() {
        let recorder = Recorder::new();
        let harness = setup(&recorder).await;
        let id = harness.append_event(EVENT, r#"{"id":1}"#).await;
        strand(&harness, 4).await;
        age_past_min_idle().await;

        let report = harness.retry_processor().sweep().await;

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.redelivered, 0);
        assert_eq!(recorder.started(), 0);
        assert!(harness.broker.pending_ids(CHANNEL, GROUP).is_empty());

        let dead = harness.broker.entries(DEAD_LETTER);
        assert_eq!(dead.len(), 1);
        let fields = &dead[0].fields;
        assert_eq!(fields[FIELD_TYPE], EVENT);
        assert_eq!(fields[FIELD_EVENT_ID], "evt-1");
        assert_eq!(fields[FIELD_SOURCE_CHANNEL], CHANNEL);
        assert_eq!(fields[FIELD_SOURCE_GROUP], GROUP);
        assert_eq!(fields[FIELD_SOURCE_ID], id.to_string());
        assert_eq!(fields[FIELD_DELIVERY_COUNT], "4");

        let journal = harness.broker.journal();
        let dead_letter_write = journal
            .iter()
            .position(|r| r.op == BrokerOp::Append && r.channel.as_deref() == Some(DEAD_LETTER))
            .unwrap();
        let ack = journal.iter().position(|r| r.op == BrokerOp::Ack).unwrap();
        assert!(dead_letter_write < ack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dead_letter_write_keeps_entry_pending() {
        let recorder = Recorder::new();
        let harness = setup(&recorder).await;
        let id = harness.append_event(EVENT, r#"{"id":1}"#).await;
        strand(&harness, 4).await;
        age_past_min_idle().await;
        harness.broker.fail_appends_to(DEAD_LETTER, true);
        let processor = harness.retry_processor();

        let report = processor.sweep().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(harness.broker.pending_ids(CHANNEL, GROUP), vec![id]);
        assert_eq!(harness.broker.op_count(BrokerOp::Ack), 0);
        assert_eq!(harness.health().mode(), HealthMode::Active);

        age_past_min_idle().await;
        let report = processor.sweep().await;
        assert_eq!(report.claimed, 1);
        assert_eq!(report.failed, 1);

        harness.broker.fail_appends_to(DEAD_LETTER, false);
        age_past_min_idle().await;
        let report = processor.sweep().await;
        assert_eq!(report.dead_lettered, 1);
        assert!(harness.broker.pending_ids(CHANNEL, GROUP).is_empty());
        assert_eq!(harness.broker.entries(DEAD_LETTER).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_pending_entry_is_dropped() {
        let recorder = Recorder::new();
        let harness = setup(&recorder).await;
        let only_type = [(FIELD_TYPE.to_string(), EVENT.to_string())]
            .into_iter()
            .collect();
        harness.broker.append(CHANNEL, only_type).await.unwrap();
        strand(&harness, 1).await;
        age_past_min_idle().await;

        let report = harness.retry_processor().sweep().await;

        assert_eq!(report.dropped, 1);
        assert!(harness.broker.pending_ids(CHANNEL, GROUP).is_empty());
        assert!(harness.broker.entries(DEAD_LETTER).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_redelivery_stays_pending() {
        let recorder = Recorder::failing();
        let harness = setup(&recorder).await;
        let id = harness.append_event(EVENT, r#"{"id":1}"#).await;
        strand(&harness, 1).await;
        age_past_min_idle().await;

        let report = harness.retry_processor().sweep().await;

        assert_eq!(report.failed, 1);
        assert_eq!(recorder.started(), 1);
        let pending = harness.broker.pending(CHANNEL, GROUP, 10).await.unwrap();
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].consumer, "retrier");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recently_delivered_entries_are_left_alone() {
        let recorder = Recorder::new();
        let harness = setup(&recorder).await;
        harness.append_event(EVENT, r#"{"id":1}"#).await;
        strand(&harness, 1).await;
        tokio::time::advance(Duration::from_millis(500)).await;

        let report = harness.retry_processor().sweep().await;

        assert_eq!(report, SweepReport::default());
        assert_eq!(harness.broker.op_count(BrokerOp::Claim), 0);
        assert_eq!(harness.broker.pending_ids(CHANNEL, GROUP).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_broker_skips_sweep() {
        let recorder = Recorder::new();
        let harness = setup(&recorder).await;
        harness.append_event(EVENT, r#"{"id":1}"#).await;
        strand(&harness, 1).await;
        age_past_min_idle().await;
        harness.health().enter_degraded();

        let report = harness.retry_processor().sweep().await;

        assert_eq!(report, SweepReport::default());
        assert_eq!(harness.broker.op_count(BrokerOp::Pending), 0);
        assert_eq!(harness.broker.op_count(BrokerOp::Ping), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_sweep_is_skipped() {
        let recorder = Recorder::with_delay(Duration::from_secs(10));
        let harness = setup(&recorder).await;
        harness.append_event(EVENT, r#"{"id":1}"#).await;
        strand(&harness, 1).await;
        age_past_min_idle().await;
        let processor = Arc::new(harness.retry_processor());

        let first = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.sweep().await })
        };
        eventually("first sweep is handling", || recorder.started() == 1).await;

        assert!(processor.sweep().await.skipped);
        let first = first.await.unwrap();
        assert!(!first.skipped);
        assert_eq!(first.redelivered, 1);

        assert!(!processor.sweep().await.skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_sweeps_on_interval_until_shutdown() {
        let recorder = Recorder::new();
        let mut config = test_config();
        config.retry.sweep_interval_ms = 10_000;
        let registry = HandlerRegistry::build([recorder.binding(feed(), EVENT)]).unwrap();
        let harness = Harness::with_config(registry, config);
        harness.ensure_all().await;
        harness.append_event(EVENT, r#"{"id":1}"#).await;
        strand(&harness, 1).await;

        let shutdown = crate::core::shutdown::ShutdownCoordinator::new();
        let processor = Arc::new(harness.retry_processor());
        let scheduler = {
            let processor = processor.clone();
            let shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move { processor.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(9_000)).await;
        assert_eq!(harness.broker.op_count(BrokerOp::Pending), 0);

        eventually("redelivered by scheduled sweep", || recorder.count() == 1).await;
        assert!(harness.broker.pending_ids(CHANNEL, GROUP).is_empty());

        shutdown.trigger_shutdown();
        scheduler.await.unwrap();
    }

    fn exploding_binding(handled: Arc<Mutex<Vec<u64>>>) -> HandlerBinding {
        HandlerBinding::typed(feed(), EVENT, move |value: serde_json::Value| {
            let handled = handled.clone();
            async move {
                if value["boom"] == true {
                    panic!("redelivery exploded");
                }
                handled.lock().unwrap().extend(value["id"].as_u64());
                Ok::<(), HandlerError>(())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_redelivery_counts_as_failed() {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::build([exploding_binding(handled.clone())]).unwrap();
        let harness = Harness::new(registry);
        harness.ensure_all().await;
        let id = harness.append_event(EVENT, r#"{"boom":true}"#).await;
        strand(&harness, 1).await;
        age_past_min_idle().await;

        let report = harness.retry_processor().sweep().await;

        assert_eq!(report.claimed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.redelivered, 0);
        assert_eq!(harness.broker.pending_ids(CHANNEL, GROUP), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_survives_panicking_redelivery() {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let mut config = test_config();
        config.retry.sweep_interval_ms = 2_000;
        let registry = HandlerRegistry::build([exploding_binding(handled.clone())]).unwrap();
        let harness = Harness::with_config(registry, config);
        harness.ensure_all().await;
        let poison = harness.append_event(EVENT, r#"{"boom":true}"#).await;
        strand(&harness, 1).await;

        let shutdown = crate::core::shutdown::ShutdownCoordinator::new();
        let processor = Arc::new(harness.retry_processor());
        let scheduler = {
            let processor = processor.clone();
            let shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move { processor.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(!scheduler.is_finished());
        assert_eq!(harness.broker.pending_ids(CHANNEL, GROUP), vec![poison]);

        harness.append_event(EVENT, r#"{"id":2}"#).await;
        strand(&harness, 1).await;

        eventually("later sweep redelivers the good entry", || {
            *handled.lock().unwrap() == vec![2]
        })
        .await;
        assert!(!scheduler.is_finished());
        assert_eq!(harness.broker.pending_ids(CHANNEL, GROUP), vec![poison]);

        shutdown.trigger_shutdown();
        scheduler.await.unwrap();
    }
}
