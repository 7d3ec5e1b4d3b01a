//! Synchronous-mode publishing tests

use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use courier_core::{
    BrokerNodeConfig, ConnectError, CourierConfig, CourierError, DeliveryError, OutboundMessage,
    RoutingKey, UnavailableReason,
};
use courier_runtime::{ConfirmMode, MemoryBroker, SyncPublisher};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(hosts: &[&str]) -> CourierConfig {
    CourierConfig::testing(
        hosts
            .iter()
            .map(|h| {
                BrokerNodeConfig::new(*h, 5672)
                    .with_credentials("courier", "secret")
                    .with_exchange("events")
            })
            .collect(),
    )
}

fn message() -> OutboundMessage {
    let key: RoutingKey = "orders.created.certified".parse().unwrap();
    OutboundMessage::new(json!({ "order": 42 }), key)
}

#[tokio::test]
async fn test_publish_confirms_inline() {
    init_tracing();
    let broker = MemoryBroker::new();
    let mut publisher = SyncPublisher::new(config(&["mq1"]), broker.clone()).unwrap();

    timeout(TEST_TIMEOUT, publisher.publish(&message()))
        .await
        .expect("publish resolves")
        .expect("publish confirmed");

    let records = broker.published();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tag, 1);
    assert_eq!(records[0].routing_key, "orders.created.certified");

    publisher.close().await;
}

#[tokio::test]
async fn test_failing_channel_exhausts_attempt_budget() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.fail_publishes(100);
    let mut publisher = SyncPublisher::new(config(&["mq1"]), broker.clone()).unwrap();

    let outcome = timeout(TEST_TIMEOUT, publisher.publish(&message()))
        .await
        .expect("publish resolves");
    match outcome {
        Err(CourierError::Delivery(DeliveryError::AttemptsExhausted { attempts: 3 })) => {}
        other => panic!("expected three exhausted attempts, got {:?}", other),
    }

    // Three attempts, three fresh sessions, zero accepted publishes
    assert_eq!(broker.publish_count(), 0);
    assert_eq!(broker.connect_count(), 3);
}

#[tokio::test]
async fn test_nacking_broker_exhausts_attempt_budget() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.set_confirm_mode(ConfirmMode::NackAll);
    let mut publisher = SyncPublisher::new(config(&["mq1"]), broker.clone()).unwrap();

    let outcome = timeout(TEST_TIMEOUT, publisher.publish(&message()))
        .await
        .expect("publish resolves");
    assert!(matches!(
        outcome,
        Err(CourierError::Delivery(DeliveryError::AttemptsExhausted { .. }))
    ));
    assert_eq!(broker.publish_count(), 3);
}

#[tokio::test]
async fn test_unroutable_retries_emergency_then_errors() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.return_unroutable(2);
    let mut publisher = SyncPublisher::new(config(&["mq1"]), broker.clone()).unwrap();

    let outcome = timeout(TEST_TIMEOUT, publisher.publish(&message()))
        .await
        .expect("publish resolves");
    assert!(matches!(
        outcome,
        Err(CourierError::Delivery(DeliveryError::UnroutableDropped { .. }))
    ));

    let keys: Vec<String> = broker
        .published()
        .iter()
        .map(|r| r.routing_key.clone())
        .collect();
    assert_eq!(
        keys,
        vec![
            "orders.created.certified".to_string(),
            "emergency.unroutable.retry".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_unroutable_recovers_via_emergency_key() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.return_unroutable(1);
    let mut publisher = SyncPublisher::new(config(&["mq1"]), broker.clone()).unwrap();

    timeout(TEST_TIMEOUT, publisher.publish(&message()))
        .await
        .expect("publish resolves")
        .expect("emergency retry confirmed");
    assert_eq!(
        broker.published()[1].routing_key,
        "emergency.unroutable.retry"
    );
}

#[tokio::test]
async fn test_garbled_confirmation_is_a_protocol_error() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.set_confirm_mode(ConfirmMode::Garbled);
    let mut publisher = SyncPublisher::new(config(&["mq1"]), broker.clone()).unwrap();

    let outcome = timeout(TEST_TIMEOUT, publisher.publish(&message()))
        .await
        .expect("publish resolves");
    assert!(matches!(outcome, Err(CourierError::Protocol(_))));
}

#[tokio::test]
async fn test_connect_failover_between_attempts() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.fail_connect(
        "mq1",
        ConnectError::Network {
            node: "mq1:5672/".to_string(),
            reason: "refused".to_string(),
        },
    );
    let mut publisher = SyncPublisher::new(config(&["mq1", "mq2"]), broker.clone()).unwrap();

    timeout(TEST_TIMEOUT, publisher.publish(&message()))
        .await
        .expect("publish resolves")
        .expect("publish confirmed on a healthy node");
    assert_eq!(broker.publish_count(), 1);
}

#[tokio::test]
async fn test_unreachable_cluster_is_fatal() {
    init_tracing();
    let broker = MemoryBroker::new();
    for _ in 0..10 {
        broker.fail_connect(
            "mq1",
            ConnectError::AuthenticationFailed {
                node: "mq1:5672/".to_string(),
            },
        );
    }
    let mut publisher = SyncPublisher::new(config(&["mq1"]), broker.clone()).unwrap();

    let outcome = timeout(TEST_TIMEOUT, publisher.publish(&message()))
        .await
        .expect("publish resolves");
    match outcome {
        Err(CourierError::Unavailable { reason }) => {
            assert_eq!(reason, UnavailableReason::AuthenticationFailure);
        }
        other => panic!("expected fatal unavailability, got {:?}", other),
    }
}
