use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use postbox_core::{
    AsyncInboxStore, CircuitBreakerConfig, InboxKey, InboxStore, InboxSweepConfig, MapperRegistry,
    Message, MessageBody, MessageHeader, MessageId, MessageProducer, MessageType,
    OutboxCircuitBreaker, OutboxEntry, OutboxProducerMediator, OutboxStore, PolicyRegistry,
    ProducerRegistry, RetryPolicy, SweeperConfig, DEFAULT_RETRY_POLICY,
};
use postbox_persistence::{InMemoryInbox, InMemoryOutbox};
use postbox_testing::{FailingProducer, RecordingProducer};

use crate::{InboxExpirySweeper, OutboxSweeper};

fn aged_entry(id: &str, topic: &str, age: Duration) -> OutboxEntry {
    let message = Message::new(
        MessageHeader::new(MessageId::from(id), topic, MessageType::Command),
        MessageBody::new(b"{}".to_vec(), MessageBody::JSON),
    );
    OutboxEntry::created_at(message, Utc::now() - chrono::Duration::from_std(age).unwrap())
}

fn mediator(outbox: Arc<InMemoryOutbox>, producers: ProducerRegistry) -> OutboxProducerMediator {
    OutboxProducerMediator::new(producers, MapperRegistry::new())
        .with_outbox(outbox.clone())
        .with_async_outbox(outbox)
        .with_policies(Arc::new(
            PolicyRegistry::default().with_policy(DEFAULT_RETRY_POLICY, RetryPolicy::no_retry()),
        ))
}

#[tokio::test]
async fn test_sweep_dispatches_aged_entries_once() {
    let outbox = Arc::new(InMemoryOutbox::default());
    for id in ["m-1", "m-2", "m-3"] {
        OutboxStore::add(outbox.as_ref(), aged_entry(id, "orders", Duration::from_millis(600))).unwrap();
    }
    let producer = Arc::new(RecordingProducer::new());
    let sweeper = OutboxSweeper::new(
        Arc::new(mediator(outbox.clone(), ProducerRegistry::new().with_producer("orders", producer.clone()))),
        SweeperConfig::default().with_min_age(Duration::from_millis(500)),
    );

    let report = sweeper.sweep().await.unwrap().unwrap();
    assert_eq!(report.dispatched.len(), 3);
    for id in ["m-1", "m-2", "m-3"] {
        let entry = OutboxStore::get(outbox.as_ref(), &MessageId::from(id)).unwrap().unwrap();
        assert!(entry.is_dispatched());
        assert_eq!(producer.times_sent(&MessageId::from(id)), 1);
    }

    let again = sweeper.sweep().await.unwrap().unwrap();
    assert_eq!(again.total(), 0);
    assert_eq!(producer.count(), 3);
}

#[tokio::test]
async fn test_sweep_leaves_young_entries_alone() {
    let outbox = Arc::new(InMemoryOutbox::default());
    OutboxStore::add(outbox.as_ref(), aged_entry("fresh", "orders", Duration::ZERO)).unwrap();
    let producer = Arc::new(RecordingProducer::new());
    let sweeper = OutboxSweeper::new(
        Arc::new(mediator(outbox.clone(), ProducerRegistry::new().with_producer("orders", producer.clone()))),
        SweeperConfig::default().with_min_age(Duration::from_secs(5)),
    );

    let report = sweeper.sweep().await.unwrap().unwrap();
    assert_eq!(report.total(), 0);
    assert_eq!(producer.count(), 0);
}

#[tokio::test]
async fn test_sweep_respects_batch_size() {
    let outbox = Arc::new(InMemoryOutbox::default());
    for i in 0..5 {
        let id = format!("m-{i}");
        OutboxStore::add(outbox.as_ref(), aged_entry(&id, "orders", Duration::from_secs(10))).unwrap();
    }
    let producer = Arc::new(RecordingProducer::new());
    let sweeper = OutboxSweeper::new(
        Arc::new(mediator(outbox.clone(), ProducerRegistry::new().with_producer("orders", producer.clone()))),
        SweeperConfig::default()
            .with_min_age(Duration::from_secs(1))
            .with_batch_size(2),
    );

    sweeper.sweep().await.unwrap();
    assert_eq!(producer.count(), 2);
    assert_eq!(OutboxStore::outstanding_count(outbox.as_ref()).unwrap(), 3);
}

#[tokio::test]
async fn test_tripped_topic_is_skipped_until_cooldown() {
    let outbox = Arc::new(InMemoryOutbox::default());
    OutboxStore::add(outbox.as_ref(), aged_entry("down-1", "billing", Duration::from_secs(10))).unwrap();
    OutboxStore::add(outbox.as_ref(), aged_entry("up-1", "orders", Duration::from_secs(10))).unwrap();

    let failing = Arc::new(FailingProducer::always());
    let healthy = Arc::new(RecordingProducer::new());
    let producers = ProducerRegistry::new()
        .with_producer("billing", failing.clone())
        .with_producer("orders", healthy.clone());
    let breaker = Arc::new(OutboxCircuitBreaker::new(
        CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_secs(60)),
    ));
    let mediator = Arc::new(mediator(outbox.clone(), producers).with_circuit_breaker(breaker.clone()));
    let sweeper = OutboxSweeper::new(mediator, SweeperConfig::default().with_min_age(Duration::from_secs(1)));

    let first = sweeper.sweep().await.unwrap().unwrap();
    assert_eq!(first.failed, vec![MessageId::from("down-1")]);
    assert_eq!(first.dispatched, vec![MessageId::from("up-1")]);

    // The open topic is left out of the batch entirely.
    let second = sweeper.sweep().await.unwrap().unwrap();
    assert_eq!(second.total(), 0);
    assert_eq!(failing.attempts(), 1);

    breaker.reset(&"billing".into());
    let third = sweeper.sweep().await.unwrap().unwrap();
    assert_eq!(third.failed.len(), 1);
    assert_eq!(failing.attempts(), 2);
}

#[tokio::test]
async fn test_tripped_backlog_does_not_starve_other_topics() {
    let outbox = Arc::new(InMemoryOutbox::default());
    for (i, id) in ["b-1", "b-2", "b-3"].into_iter().enumerate() {
        let age = Duration::from_secs(60 - i as u64);
        OutboxStore::add(outbox.as_ref(), aged_entry(id, "billing", age)).unwrap();
    }
    OutboxStore::add(outbox.as_ref(), aged_entry("o-1", "orders", Duration::from_secs(10))).unwrap();

    let healthy = Arc::new(RecordingProducer::new());
    let producers = ProducerRegistry::new()
        .with_producer("billing", Arc::new(FailingProducer::always()))
        .with_producer("orders", healthy.clone());
    let breaker = Arc::new(OutboxCircuitBreaker::new(
        CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_secs(60)),
    ));
    breaker.record_failure(&"billing".into());
    let mediator = Arc::new(mediator(outbox.clone(), producers).with_circuit_breaker(breaker));
    let sweeper = OutboxSweeper::new(
        mediator,
        SweeperConfig::default()
            .with_min_age(Duration::from_secs(1))
            .with_batch_size(3),
    );

    let report = sweeper.sweep().await.unwrap().unwrap();
    assert_eq!(report.dispatched, vec![MessageId::from("o-1")]);
    assert_eq!(healthy.times_sent(&MessageId::from("o-1")), 1);
    assert_eq!(OutboxStore::outstanding_count(outbox.as_ref()).unwrap(), 3);
}

#[tokio::test]
async fn test_undispatchable_entries_do_not_block_the_sweep() {
    let outbox = Arc::new(InMemoryOutbox::default());
    OutboxStore::add(outbox.as_ref(), aged_entry("orphan", "no-producer", Duration::from_secs(30))).unwrap();
    let empty = Message::new(
        MessageHeader::new(MessageId::from("blank"), "orders", MessageType::None),
        MessageBody::empty(),
    );
    OutboxStore::add(outbox.as_ref(), OutboxEntry::created_at(empty, Utc::now() - chrono::Duration::seconds(20))).unwrap();
    OutboxStore::add(outbox.as_ref(), aged_entry("good", "orders", Duration::from_secs(10))).unwrap();

    let producer = Arc::new(RecordingProducer::new());
    let sweeper = OutboxSweeper::new(
        Arc::new(mediator(outbox.clone(), ProducerRegistry::new().with_producer("orders", producer.clone()))),
        SweeperConfig::default().with_min_age(Duration::from_secs(1)),
    );

    for _ in 0..2 {
        let report = sweeper.sweep().await.unwrap().unwrap();
        let errored: Vec<MessageId> = report.errored.iter().map(|e| e.id.clone()).collect();
        assert_eq!(errored, vec![MessageId::from("orphan"), MessageId::from("blank")]);
        assert!(!report.is_clean());
    }
    assert_eq!(producer.times_sent(&MessageId::from("good")), 1);
    assert_eq!(OutboxStore::outstanding_count(outbox.as_ref()).unwrap(), 2);
}

struct SlowProducer;

#[async_trait]
impl MessageProducer for SlowProducer {
    fn send(&self, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_async(&self, _message: &Message) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_overlapping_sweep_is_skipped() {
    let outbox = Arc::new(InMemoryOutbox::default());
    OutboxStore::add(outbox.as_ref(), aged_entry("slow", "orders", Duration::from_secs(10))).unwrap();
    let sweeper = OutboxSweeper::new(
        Arc::new(mediator(outbox.clone(), ProducerRegistry::new().with_producer("orders", Arc::new(SlowProducer)))),
        SweeperConfig::default().with_min_age(Duration::from_secs(1)),
    );

    let (first, second) = tokio::join!(sweeper.sweep(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        sweeper.sweep().await
    });
    assert_eq!(first.unwrap().unwrap().dispatched.len(), 1);
    assert!(second.unwrap().is_none());

    assert!(sweeper.sweep().await.unwrap().is_some());
}

#[tokio::test]
async fn test_sweep_purges_dispatched_after_retention() {
    let outbox = Arc::new(InMemoryOutbox::default());
    OutboxStore::add(outbox.as_ref(), aged_entry("m-1", "orders", Duration::from_secs(10))).unwrap();
    let sweeper = OutboxSweeper::new(
        Arc::new(mediator(
            outbox.clone(),
            ProducerRegistry::new().with_producer("orders", Arc::new(RecordingProducer::new())),
        )),
        SweeperConfig::default()
            .with_min_age(Duration::from_secs(1))
            .with_purge_dispatched_after(Duration::from_millis(5)),
    );

    sweeper.sweep().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    sweeper.sweep().await.unwrap();
    assert!(outbox.is_empty());
}

#[tokio::test]
async fn test_started_sweeper_runs_until_shutdown() {
    let outbox = Arc::new(InMemoryOutbox::default());
    for id in ["a", "b", "c"] {
        OutboxStore::add(outbox.as_ref(), aged_entry(id, "orders", Duration::from_millis(50))).unwrap();
    }
    let producer = Arc::new(RecordingProducer::new());
    let sweeper = Arc::new(OutboxSweeper::new(
        Arc::new(mediator(outbox.clone(), ProducerRegistry::new().with_producer("orders", producer.clone()))),
        SweeperConfig::default()
            .with_interval(Duration::from_millis(10))
            .with_min_age(Duration::from_millis(10)),
    ));

    let handle = sweeper.start();
    tokio::time::timeout(Duration::from_secs(2), async {
        while producer.count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sweeper should dispatch every entry");
    handle.shutdown().await;

    assert_eq!(producer.count(), 3);
    assert_eq!(OutboxStore::outstanding_count(outbox.as_ref()).unwrap(), 0);
}

#[tokio::test]
async fn test_zero_interval_sweeper_keeps_running() {
    let outbox = Arc::new(InMemoryOutbox::default());
    OutboxStore::add(outbox.as_ref(), aged_entry("a", "orders", Duration::from_secs(10))).unwrap();
    let producer = Arc::new(RecordingProducer::new());
    let mut config = SweeperConfig::default().with_min_age(Duration::from_secs(1));
    config.interval = Duration::ZERO;
    let sweeper = Arc::new(OutboxSweeper::new(
        Arc::new(mediator(outbox.clone(), ProducerRegistry::new().with_producer("orders", producer.clone()))),
        config,
    ));

    let handle = sweeper.start();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!handle.is_finished());
    handle.shutdown().await;
    assert_eq!(producer.count(), 1);
}

#[tokio::test]
async fn test_inbox_sweeper_purges_expired_entries() {
    let store = Arc::new(InMemoryInbox::default());
    let written = Utc::now() - chrono::Duration::seconds(30);
    InboxStore::add(store.as_ref(), InboxKey::new("old", "ctx"), "{}".into(), written, Some(Duration::from_secs(1))).unwrap();
    InboxStore::add(store.as_ref(), InboxKey::new("live", "ctx"), "{}".into(), Utc::now(), Some(Duration::from_secs(3600))).unwrap();

    let sweeper = InboxExpirySweeper::new(store.clone(), InboxSweepConfig::default());
    assert_eq!(sweeper.sweep().await.unwrap(), 1);
    assert!(!AsyncInboxStore::exists(store.as_ref(), &InboxKey::new("old", "ctx")).await.unwrap());
    assert!(InboxStore::exists(store.as_ref(), &InboxKey::new("live", "ctx")).unwrap());
}

#[tokio::test]
async fn test_inbox_sweeper_task_lifecycle() {
    let store = Arc::new(InMemoryInbox::default());
    let handle = InboxExpirySweeper::new(store, InboxSweepConfig::default().with_interval(Duration::from_millis(10)))
        .start();
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert!(!handle.is_finished());
    handle.shutdown().await;
}
