mod common;

use common::{consumer_config, memory, producer_config, wait_until, Recorder, TOPIC};
use price_pipeline::broker::MemoryBroker;
use price_pipeline::codec::{self, PriceUpdate};
use price_pipeline::consumer::ClientState;
use price_pipeline::topic::PartitionStrategy;
use price_pipeline::{ConsumerGroupClient, Error, ProducerClient, Record};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

fn price(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

async fn subscribed(
    broker: &MemoryBroker,
    group_id: &str,
    poll_interval_ms: u64,
    recorder: &Recorder,
) -> ConsumerGroupClient<price_pipeline::broker::memory::MemoryConsumer> {
    let config = consumer_config(group_id, memory(), poll_interval_ms);
    let transport = broker.consumer(config.auto_offset_reset).unwrap();
    let mut client = ConsumerGroupClient::new(config, transport).unwrap();
    client.subscribe([TOPIC], recorder.clone()).await.unwrap();
    client
}

#[tokio::test]
async fn test_end_to_end_price_update() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 1);

    let recorder = Recorder::default();
    let mut inventory = subscribed(&broker, "inventorySystem", 1000, &recorder)
        .await
        .spawn();

    let producer = ProducerClient::new(producer_config(memory()), broker.producer().unwrap()).unwrap();
    let event = PriceUpdate::new("ABC", price("100.00"));
    let sent = producer
        .send(Record::from_event(TOPIC, &event).with_partition(0))
        .await
        .unwrap();
    producer.close().await;

    assert_eq!(sent.partition, 0);
    assert_eq!(sent.offset, Some(0));
    assert_eq!(sent.attempts, 1);

    assert!(wait_until(Duration::from_secs(5), || recorder.len() == 1).await);
    // Give the loop another full interval to deliver anything extra.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    inventory.close().await.unwrap();

    let deliveries = recorder.deliveries();
    assert_eq!(deliveries.len(), 1);
    let delivery = &deliveries[0];
    // Delivered by the first poll that saw the record, not a redelivery.
    assert!(delivery.batch >= 1);
    assert_eq!(delivery.topic, TOPIC);
    assert_eq!(delivery.partition, 0);
    assert_eq!(delivery.offset, 0);
    assert_eq!(delivery.event, event);
    assert_eq!(
        &codec::encode(&delivery.event)[..],
        br#"{"Product":"ABC","UpdatedPrice":100.00}"#
    );
    assert_eq!(broker.committed_offset("inventorySystem", TOPIC, 0), Some(1));
}

#[tokio::test]
async fn test_single_partition_order_preserved() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 1);

    let recorder = Recorder::default();
    let mut consumer = subscribed(&broker, "inventorySystem", 10, &recorder)
        .await
        .spawn();

    let producer = ProducerClient::new(producer_config(memory()), broker.producer().unwrap()).unwrap();
    for i in 0..10 {
        let event = PriceUpdate::new(format!("P{}", i), Decimal::new(i, 0));
        producer.send_event(TOPIC, &event, Some(0)).await.unwrap();
    }
    producer.close().await;

    assert!(wait_until(Duration::from_secs(5), || recorder.len() == 10).await);
    consumer.close().await.unwrap();

    let offsets: Vec<i64> = recorder.deliveries().iter().map(|d| d.offset).collect();
    assert_eq!(offsets, (0..10).collect::<Vec<i64>>());
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_distinct_groups_each_receive_every_record() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 2);

    let inventory_seen = Recorder::default();
    let analytics_seen = Recorder::default();
    let mut inventory = subscribed(&broker, "inventorySystem", 10, &inventory_seen)
        .await
        .spawn();
    let mut analytics = subscribed(&broker, "pricingAnalytics", 25, &analytics_seen)
        .await
        .spawn();

    let producer = ProducerClient::new(producer_config(memory()), broker.producer().unwrap()).unwrap();
    let mut published = HashSet::new();
    for i in 0..12 {
        let event = PriceUpdate::new(format!("P{}", i), Decimal::new(i * 100, 2));
        let sent = producer.send_event(TOPIC, &event, None).await.unwrap();
        published.insert((sent.partition, sent.offset.unwrap()));
    }
    producer.close().await;

    assert!(wait_until(Duration::from_secs(5), || inventory_seen.len() == 12 && analytics_seen.len() == 12).await);
    inventory.close().await.unwrap();
    analytics.close().await.unwrap();

    for recorder in [&inventory_seen, &analytics_seen] {
        let seen: HashSet<(i32, i64)> = recorder
            .deliveries()
            .iter()
            .map(|d| (d.partition, d.offset))
            .collect();
        assert_eq!(seen, published);
        assert_eq!(recorder.len(), 12);
    }
}

#[tokio::test]
async fn test_shared_group_splits_partitions() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 2);

    let first_seen = Recorder::default();
    let second_seen = Recorder::default();
    let first = subscribed(&broker, "inventorySystem", 10, &first_seen).await;
    let second = subscribed(&broker, "inventorySystem", 10, &second_seen).await;
    assert_eq!(broker.group_members("inventorySystem"), 2);
    let mut first = first.spawn();
    let mut second = second.spawn();

    let mut config = producer_config(memory());
    config.partitioner = PartitionStrategy::RoundRobin;
    let producer = ProducerClient::new(config, broker.producer().unwrap()).unwrap();
    for i in 0..20 {
        let event = PriceUpdate::new(format!("P{}", i), Decimal::new(i, 0));
        producer.send_event(TOPIC, &event, None).await.unwrap();
    }
    producer.close().await;

    assert!(wait_until(Duration::from_secs(5), || first_seen.len() + second_seen.len() == 20).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.close().await.unwrap();
    second.close().await.unwrap();

    let first_deliveries = first_seen.deliveries();
    let second_deliveries = second_seen.deliveries();
    assert_eq!(first_deliveries.len() + second_deliveries.len(), 20);

    let products: HashSet<String> = first_deliveries
        .iter()
        .chain(second_deliveries.iter())
        .map(|d| d.event.product_name().to_string())
        .collect();
    assert_eq!(products.len(), 20);

    let first_partitions: HashSet<i32> = first_deliveries.iter().map(|d| d.partition).collect();
    let second_partitions: HashSet<i32> = second_deliveries.iter().map(|d| d.partition).collect();
    assert_eq!(first_partitions.len(), 1);
    assert_eq!(second_partitions.len(), 1);
    assert!(first_partitions.is_disjoint(&second_partitions));
}

#[tokio::test]
async fn test_exhausted_retries_surface_delivery_error() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 1);
    broker.fail_next_produces(usize::MAX);

    let producer = ProducerClient::new(producer_config(memory()), broker.producer().unwrap()).unwrap();
    let event = PriceUpdate::new("ABC", price("100.00"));
    let err = producer.send_event(TOPIC, &event, Some(0)).await.unwrap_err();
    producer.close().await;

    assert!(matches!(err, Error::Delivery { attempts: 4, .. }));
    assert_eq!(broker.produce_attempts(), 4);
    assert_eq!(broker.log_end_offset(TOPIC, 0), 0);
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_close_twice_on_both_clients() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 1);

    let producer = ProducerClient::new(producer_config(memory()), broker.producer().unwrap()).unwrap();
    let mut consumer = subscribed(&broker, "inventorySystem", 10, &Recorder::default()).await;

    producer.close().await;
    producer.close().await;
    consumer.close().await;
    consumer.close().await;

    assert!(producer.is_closed().await);
    assert_eq!(consumer.state(), ClientState::Closed);
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_restarted_member_resumes_after_committed_prefix() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 1);

    let producer = ProducerClient::new(producer_config(memory()), broker.producer().unwrap()).unwrap();
    let first_seen = Recorder::default();
    let mut first = subscribed(&broker, "inventorySystem", 10, &first_seen)
        .await
        .spawn();

    for i in 0..3 {
        producer
            .send_event(TOPIC, &PriceUpdate::new(format!("P{}", i), Decimal::ONE), Some(0))
            .await
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || first_seen.len() == 3).await);
    first.close().await.unwrap();

    for i in 3..5 {
        producer
            .send_event(TOPIC, &PriceUpdate::new(format!("P{}", i), Decimal::ONE), Some(0))
            .await
            .unwrap();
    }
    producer.close().await;

    let second_seen = Recorder::default();
    let mut second = subscribed(&broker, "inventorySystem", 10, &second_seen)
        .await
        .spawn();
    assert!(wait_until(Duration::from_secs(5), || second_seen.len() == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    second.close().await.unwrap();

    let offsets: Vec<i64> = second_seen.deliveries().iter().map(|d| d.offset).collect();
    assert_eq!(offsets, vec![3, 4]);
}
