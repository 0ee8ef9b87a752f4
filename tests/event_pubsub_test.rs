use std::time::Duration;
use tokio::time::timeout;
use tokio_stream::StreamExt;

use rpc_registry::services::event::{EventBus, EventConfig, EventError, EventKind, RegistryEvent};
use rpc_registry::services::model::ServiceKey;

fn published(app_name: &str) -> RegistryEvent {
    RegistryEvent::new(
        EventKind::ProviderPublished,
        ServiceKey::from("Echo:1.0@bolt"),
        app_name,
    )
    .with_urls(vec!["bolt://127.0.0.1:12200".to_string()])
}

#[tokio::test]
async fn test_event_publish_subscribe() {
    // 创建事件总线
    let config = EventConfig {
        max_subscribers_per_type: 10,
        channel_capacity: 100,
        enable_metrics: true,
    };
    let event_bus = EventBus::new(config);

    // 创建订阅
    let mut event_stream = event_bus
        .subscribe_event_type(EventKind::ProviderPublished, "test-subscriber")
        .expect("Failed to subscribe to event type");
    assert!(event_bus.is_enabled(EventKind::ProviderPublished));
    assert!(!event_bus.is_enabled(EventKind::ConsumerSubscribed));

    // 发布事件
    let publish_result = event_bus.publish_event(published("echo-server"));
    assert_eq!(publish_result.unwrap(), 1); // 应该有1个订阅者

    // 接收事件
    let received_event = timeout(Duration::from_secs(1), event_stream.next())
        .await
        .expect("Timeout waiting for event")
        .expect("Stream ended unexpectedly")
        .expect("Event stream error");

    // 验证接收到的事件，id 和时间戳由总线补齐
    assert_eq!(received_event.kind, EventKind::ProviderPublished);
    assert_eq!(received_event.app_name, "echo-server");
    assert_eq!(received_event.urls, vec!["bolt://127.0.0.1:12200".to_string()]);
    assert!(!received_event.event_id.is_empty());
    assert!(received_event.timestamp > 0);
}

#[tokio::test]
async fn test_multiple_subscribers() {
    let event_bus = EventBus::new(EventConfig::default());

    // 创建多个订阅者
    let mut stream1 = event_bus
        .subscribe_event_type(EventKind::ConsumerSubscribed, "subscriber-1")
        .expect("Failed to subscribe subscriber-1");
    let mut stream2 = event_bus
        .subscribe_event_type(EventKind::ConsumerSubscribed, "subscriber-2")
        .expect("Failed to subscribe subscriber-2");

    let event = RegistryEvent::new(
        EventKind::ConsumerSubscribed,
        ServiceKey::from("Echo:1.0@bolt"),
        "echo-client",
    );
    assert_eq!(event_bus.publish_event(event).unwrap(), 2); // 应该有2个订阅者

    // 两个订阅者都应该收到同一个事件
    let event1 = timeout(Duration::from_secs(1), stream1.next())
        .await
        .expect("Timeout waiting for event on stream1")
        .expect("Stream1 ended unexpectedly")
        .expect("Stream1 error");
    let event2 = timeout(Duration::from_secs(1), stream2.next())
        .await
        .expect("Timeout waiting for event on stream2")
        .expect("Stream2 ended unexpectedly")
        .expect("Stream2 error");

    assert_eq!(event1.event_id, event2.event_id);
    assert_eq!(event_bus.get_subscribers().len(), 2);
}

#[tokio::test]
async fn test_subscriber_management() {
    let event_bus = EventBus::new(EventConfig {
        max_subscribers_per_type: 1,
        ..EventConfig::default()
    });

    let _first = event_bus
        .subscribe_event_type(EventKind::ProviderPublished, "sub-mgmt")
        .expect("Failed to subscribe");
    let _second = event_bus
        .subscribe_event_type(EventKind::ConsumerSubscribed, "sub-mgmt")
        .expect("Failed to subscribe");

    // 同一订阅者记录两个事件类型
    let subscribers = event_bus.get_subscribers();
    assert_eq!(subscribers.len(), 1);
    assert_eq!(subscribers[0].event_kinds.len(), 2);

    // 超过单类型订阅者上限
    let result = event_bus.subscribe_event_type(EventKind::ProviderPublished, "another");
    assert!(matches!(
        result,
        Err(EventError::SubscriberLimitExceeded { .. })
    ));

    event_bus.remove_subscriber("sub-mgmt");
    assert!(event_bus.get_subscribers().is_empty());
}

#[tokio::test]
async fn test_event_stats() {
    let event_bus = EventBus::new(EventConfig::default());

    // 创建订阅
    let _stream = event_bus
        .subscribe_event_type(EventKind::ProviderPublished, "stats-subscriber")
        .expect("Failed to subscribe");

    let _ = event_bus.publish_event(published("stats-publisher"));

    // 检查统计信息
    let stats = event_bus.get_stats();
    assert_eq!(stats.active_event_types, 1);
    assert_eq!(stats.total_subscribers, 1);
    assert_eq!(stats.events_published, 1);
    assert_eq!(stats.events_delivered, 1);
}

#[tokio::test]
async fn test_no_subscribers() {
    let event_bus = EventBus::new(EventConfig::default());

    // 发布事件到没有订阅者的事件类型
    let result = event_bus.publish_event(published("no-sub-publisher"));
    assert!(matches!(result, Err(EventError::NoSubscribers { .. })));

    // post 不关心结果
    event_bus.post(published("no-sub-publisher"));
    assert_eq!(event_bus.get_stats().events_published, 0);
}

#[tokio::test]
async fn test_disabled_bus_skips_delivery() {
    let event_bus = EventBus::default();
    let mut stream = event_bus
        .subscribe_event_type(EventKind::ProviderPublished, "disabled-subscriber")
        .expect("Failed to subscribe");

    event_bus.set_enabled(false);
    assert!(!event_bus.is_enabled(EventKind::ProviderPublished));
    assert!(matches!(
        event_bus.publish_event(published("echo-server")),
        Err(EventError::Disabled)
    ));
    event_bus.post(published("echo-server"));

    let received = timeout(Duration::from_millis(100), stream.next()).await;
    assert!(received.is_err());
}
