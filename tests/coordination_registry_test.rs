use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;

use rpc_registry::config::{PARAM_ADD_AUTH, PARAM_AUTH_SCHEME, PARAM_CREATE_EPHEMERAL, RegistryConfig};
use rpc_registry::services::coordination::helper;
use rpc_registry::services::coordination::{
    AuthInfo, ChildEventKind, CoordinationClient, CoordinationError, CoordinationRegistry,
    CreateMode, MemoryClient, MemoryConnector,
};
use rpc_registry::services::model::{
    ConfigListener, ConsumerConfig, ListenerError, ProviderConfig, ProviderGroup,
    ProviderInfo, ProviderInfoListener, ServerConfig,
};
use rpc_registry::services::event::{EventBus, EventKind};
use rpc_registry::services::registry::{
    Registry, RegistryContext, RegistryError, RegistryFactory, ShutdownFlag,
};

const ADDRESS: &str = "127.0.0.1:2181/rpc";
const CONNECT_STRING: &str = "127.0.0.1:2181";
const PROVIDERS_PATH: &str = "/rpc/Echo/providers";

struct ChannelListener(mpsc::UnboundedSender<ProviderGroup>);

impl ProviderInfoListener for ChannelListener {
    fn update_providers(&self, group: &ProviderGroup) -> Result<(), ListenerError> {
        let _ = self.0.send(group.clone());
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
enum ConfigUpdate {
    Configs(BTreeMap<String, String>),
    Attrs(BTreeMap<String, String>),
}

struct ChannelConfigListener(mpsc::UnboundedSender<ConfigUpdate>);

impl ConfigListener for ChannelConfigListener {
    fn config_changed(&self, configs: &BTreeMap<String, String>) -> Result<(), ListenerError> {
        let _ = self.0.send(ConfigUpdate::Configs(configs.clone()));
        Ok(())
    }

    fn attr_updated(&self, attributes: &BTreeMap<String, String>) -> Result<(), ListenerError> {
        let _ = self.0.send(ConfigUpdate::Attrs(attributes.clone()));
        Ok(())
    }
}

fn context(connector: &MemoryConnector) -> RegistryContext {
    RegistryContext {
        connector: Arc::new(connector.clone()),
        ..RegistryContext::default()
    }
}

async fn started(connector: &MemoryConnector, config: RegistryConfig) -> CoordinationRegistry {
    let registry = CoordinationRegistry::new(config, context(connector));
    registry.init().await.expect("init coordination registry");
    assert!(registry.start().await.expect("start coordination registry"));
    registry
}

fn last_client(connector: &MemoryConnector) -> Arc<MemoryClient> {
    connector.last_client().expect("client connected")
}

fn echo_provider(port: u16) -> ProviderConfig {
    ProviderConfig::new("Echo")
        .with_app_name("echo-server")
        .with_server(ServerConfig::new("bolt", "127.0.0.1", port))
}

fn echo_consumer() -> (ConsumerConfig, mpsc::UnboundedReceiver<ProviderGroup>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let consumer = ConsumerConfig::new("Echo")
        .with_app_name("echo-client")
        .with_provider_listener(Arc::new(ChannelListener(tx)));
    (consumer, rx)
}

async fn next_group(updates: &mut mpsc::UnboundedReceiver<ProviderGroup>) -> ProviderGroup {
    timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("Timeout waiting for provider update")
        .expect("listener channel closed")
}

// 轮询直到条件成立
async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_register_then_unregister_leaves_no_node() {
    let connector = MemoryConnector::new();
    let registry = started(&connector, RegistryConfig::zookeeper(ADDRESS)).await;
    assert_eq!(registry.root(), Some("/rpc/"));
    let ensemble = connector.ensemble(CONNECT_STRING);

    let provider = echo_provider(12200);
    registry.register(&provider).await.unwrap();
    let paths = registry.provider_node_paths(&provider);
    assert_eq!(paths.len(), 1);
    assert!(paths[0].starts_with(PROVIDERS_PATH));
    assert!(ensemble.is_ephemeral(&paths[0]));
    assert_eq!(ensemble.data(&paths[0]), Some(b"1".to_vec()));

    // 重复注册是幂等的
    registry.register(&provider).await.unwrap();
    assert_eq!(ensemble.child_names(PROVIDERS_PATH).len(), 1);

    registry.unregister(&provider).await.unwrap();
    assert!(!ensemble.exists(&paths[0]));
    assert!(ensemble.child_names(PROVIDERS_PATH).is_empty());
    assert!(registry.provider_node_paths(&provider).is_empty());

    // 再次反注册没有记录，什么也不做
    registry.unregister(&provider).await.unwrap();
    registry.destroy().await;
}

#[tokio::test]
async fn test_payload_flip_is_an_update_not_remove_add() {
    let connector = MemoryConnector::new();
    let registry = started(&connector, RegistryConfig::zookeeper(ADDRESS)).await;

    let (consumer, mut updates) = echo_consumer();
    let initial = registry.subscribe(&consumer).await.unwrap().unwrap();
    assert!(initial[0].is_empty());

    let provider = echo_provider(12200);
    registry.register(&provider).await.unwrap();
    assert_eq!(next_group(&mut updates).await.len(), 1);

    let mut raw = last_client(&connector)
        .watch_children(PROVIDERS_PATH)
        .await
        .unwrap();

    registry.set_provider_online(&provider, false).await.unwrap();
    assert!(next_group(&mut updates).await.is_empty());
    registry.set_provider_online(&provider, true).await.unwrap();
    assert_eq!(next_group(&mut updates).await.len(), 1);

    let mut kinds = Vec::new();
    while let Ok(event) = raw.try_recv() {
        kinds.push(event.kind);
    }
    assert_eq!(kinds, vec![ChildEventKind::Updated, ChildEventKind::Updated]);

    registry.destroy().await;
}

#[tokio::test]
async fn test_offline_provider_is_published_but_not_matched() {
    let connector = MemoryConnector::new();
    let registry = started(&connector, RegistryConfig::zookeeper(ADDRESS)).await;

    let provider = echo_provider(12200).with_dynamic(false);
    registry.register(&provider).await.unwrap();
    let paths = registry.provider_node_paths(&provider);
    assert_eq!(connector.ensemble(CONNECT_STRING).data(&paths[0]), Some(b"0".to_vec()));

    let (consumer, _updates) = echo_consumer();
    let groups = registry.subscribe(&consumer).await.unwrap().unwrap();
    assert!(groups[0].is_empty());
}

#[tokio::test]
async fn test_reconnect_replays_every_recorded_node() {
    let connector = MemoryConnector::new();
    let registry = started(&connector, RegistryConfig::zookeeper(ADDRESS)).await;

    registry.register(&echo_provider(12200)).await.unwrap();
    registry.register(&echo_provider(12201)).await.unwrap();
    let (consumer, _updates) = echo_consumer();
    registry.subscribe(&consumer).await.unwrap();

    let client = last_client(&connector);
    client.reset_counters();
    client.simulate_reconnect();

    // 2 个 provider 节点 + 1 个 consumer 节点
    eventually(|| client.create_calls() >= 3).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(client.create_calls(), 3);
    assert_eq!(
        connector.ensemble(CONNECT_STRING).child_names(PROVIDERS_PATH).len(),
        2
    );

    registry.destroy().await;
}

#[tokio::test]
async fn test_session_expiry_restores_ephemeral_nodes() {
    let connector = MemoryConnector::new();
    let registry = started(&connector, RegistryConfig::zookeeper(ADDRESS)).await;
    let ensemble = connector.ensemble(CONNECT_STRING);

    let provider = echo_provider(12200);
    registry.register(&provider).await.unwrap();
    let (consumer, mut updates) = echo_consumer();
    registry.subscribe(&consumer).await.unwrap();
    let provider_path = registry.provider_node_paths(&provider)[0].clone();
    let consumer_path = registry.consumer_node_path(&consumer).expect("consumer node");

    let client = last_client(&connector);
    let old_session = client.session_id();
    client.simulate_session_expiry();
    assert_ne!(client.session_id(), old_session);

    eventually(|| ensemble.exists(&provider_path) && ensemble.exists(&consumer_path)).await;

    // 订阅方先看到端点消失，再看到它回来
    assert!(next_group(&mut updates).await.is_empty());
    assert_eq!(next_group(&mut updates).await.len(), 1);

    registry.destroy().await;
}

#[tokio::test]
async fn test_echo_end_to_end_across_registries() {
    let connector = MemoryConnector::new();
    let server_side = started(&connector, RegistryConfig::zookeeper(ADDRESS)).await;
    let client_side = started(&connector, RegistryConfig::zookeeper(ADDRESS)).await;

    let provider = echo_provider(12200);
    server_side.register(&provider).await.unwrap();

    let (consumer, mut updates) = echo_consumer();
    let groups = client_side.subscribe(&consumer).await.unwrap().unwrap();
    assert_eq!(groups.len(), 1);
    let endpoint = groups[0].providers().next().expect("one provider");
    assert_eq!(endpoint.address(), "127.0.0.1:12200");
    assert_eq!(endpoint.attribute("appName"), Some("echo-server"));

    server_side.unregister(&provider).await.unwrap();
    assert!(next_group(&mut updates).await.is_empty());

    client_side.unsubscribe(&consumer).await.unwrap();
    let consumers_path = "/rpc/Echo/consumers";
    assert!(connector.ensemble(CONNECT_STRING).child_names(consumers_path).is_empty());

    client_side.destroy().await;
    server_side.destroy().await;
}

#[tokio::test]
async fn test_version_and_group_are_separated_by_matching() {
    let connector = MemoryConnector::new();
    let registry = started(&connector, RegistryConfig::zookeeper(ADDRESS)).await;

    registry.register(&echo_provider(12200)).await.unwrap();
    registry
        .register(&echo_provider(12201).with_version("2.0"))
        .await
        .unwrap();
    registry
        .register(&echo_provider(12202).with_group("blue"))
        .await
        .unwrap();

    let (consumer, _updates) = echo_consumer();
    let groups = registry.subscribe(&consumer).await.unwrap().unwrap();
    assert_eq!(groups[0].len(), 1);

    let blue = ConsumerConfig::new("Echo").with_group("blue");
    let groups = registry.subscribe(&blue).await.unwrap().unwrap();
    assert_eq!(groups[0].providers().next().map(|p| p.port), Some(12202));
}

#[tokio::test]
async fn test_config_and_override_subtrees() {
    let connector = MemoryConnector::new();
    let registry = started(&connector, RegistryConfig::zookeeper(ADDRESS)).await;
    let raw = last_client(&connector);

    let (tx, mut config_updates) = mpsc::unbounded_channel();
    let provider = echo_provider(12200)
        .with_config_listener(Arc::new(ChannelConfigListener(tx)));
    registry.register(&provider).await.unwrap();

    let config_node = format!("/rpc/Echo/configs/{}", helper::encode("timeout=3000"));
    raw.create(&config_node, Vec::new(), CreateMode::Persistent)
        .await
        .unwrap();
    let update = timeout(Duration::from_secs(2), config_updates.recv())
        .await
        .unwrap()
        .unwrap();
    let expected = BTreeMap::from([("timeout".to_string(), "3000".to_string())]);
    assert_eq!(update, ConfigUpdate::Configs(expected));

    // 命中消费者地址的覆盖规则
    let (tx, mut attr_updates) = mpsc::unbounded_channel();
    let (consumer, mut updates) = echo_consumer();
    let consumer = consumer
        .with_address("127.0.0.1")
        .with_config_listener(Arc::new(ChannelConfigListener(tx)));
    registry.subscribe(&consumer).await.unwrap();
    // 订阅时先收到当前的接口级配置
    let update = timeout(Duration::from_secs(2), attr_updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(update, ConfigUpdate::Configs(_)));

    let rule = ProviderInfo::new("override", "127.0.0.1", 0).with_attribute("weight", "7");
    let override_node = helper::node_path("/rpc/Echo/overrides", &rule);
    raw.create(&override_node, Vec::new(), CreateMode::Persistent)
        .await
        .unwrap();

    let update = timeout(Duration::from_secs(2), attr_updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        update,
        ConfigUpdate::Attrs(BTreeMap::from([("weight".to_string(), "7".to_string())]))
    );
    let merged = next_group(&mut updates).await;
    assert_eq!(
        merged.providers().next().and_then(|p| p.attribute("weight")),
        Some("7")
    );

    raw.delete(&override_node).await.unwrap();
    let update = timeout(Duration::from_secs(2), attr_updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update, ConfigUpdate::Attrs(BTreeMap::new()));

    registry.destroy().await;
}

#[tokio::test]
async fn test_subscribe_disabled_returns_none() {
    let connector = MemoryConnector::new();
    let config = RegistryConfig {
        subscribe: false,
        ..RegistryConfig::zookeeper(ADDRESS)
    };
    let registry = started(&connector, config).await;
    let (consumer, _updates) = echo_consumer();
    assert!(registry.subscribe(&consumer).await.unwrap().is_none());
    assert!(registry.consumer_node_path(&consumer).is_none());
}

#[tokio::test]
async fn test_persistent_mode_and_default_root() {
    let connector = MemoryConnector::new();
    let config = RegistryConfig::zookeeper(CONNECT_STRING).with_parameter(PARAM_CREATE_EPHEMERAL, "false");
    let registry = started(&connector, config).await;
    assert_eq!(registry.root(), Some("/"));
    assert!(!registry.is_ephemeral());
    assert!(registry.prefers_local_file());

    let provider = echo_provider(12200);
    registry.register(&provider).await.unwrap();
    let path = registry.provider_node_paths(&provider)[0].clone();
    assert!(path.starts_with("/Echo/providers/"));
    assert!(!connector.ensemble(CONNECT_STRING).is_ephemeral(&path));
}

#[tokio::test]
async fn test_lifecycle_rules() {
    let connector = MemoryConnector::new();

    let registry = CoordinationRegistry::new(RegistryConfig::zookeeper(ADDRESS), context(&connector));
    assert!(!registry.start().await.unwrap());
    assert!(matches!(
        registry.register(&echo_provider(12200)).await,
        Err(RegistryError::BackendUnavailable(_))
    ));
    registry.init().await.unwrap();
    registry.init().await.unwrap();
    assert_eq!(connector.clients().len(), 1);
    assert!(matches!(
        registry.register(&echo_provider(12200)).await,
        Err(RegistryError::BackendUnavailable(_))
    ));

    assert!(registry.start().await.unwrap());
    registry.destroy().await;
    assert!(matches!(
        registry.register(&echo_provider(12200)).await,
        Err(RegistryError::Destroyed)
    ));
    assert!(matches!(registry.init().await, Err(RegistryError::Destroyed)));

    let empty = CoordinationRegistry::new(RegistryConfig::zookeeper(" "), context(&connector));
    assert!(matches!(
        empty.init().await,
        Err(RegistryError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_auth_is_required_by_ensemble() {
    let connector = MemoryConnector::new();
    connector
        .ensemble(CONNECT_STRING)
        .require_auth(AuthInfo::new("digest", "user:pass"));

    let anonymous = CoordinationRegistry::new(RegistryConfig::zookeeper(ADDRESS), context(&connector));
    anonymous.init().await.unwrap();
    assert!(matches!(
        anonymous.start().await,
        Err(RegistryError::Operation {
            source: CoordinationError::Auth(_),
            ..
        })
    ));

    let config = RegistryConfig::zookeeper(ADDRESS)
        .with_parameter(PARAM_AUTH_SCHEME, "digest")
        .with_parameter(PARAM_ADD_AUTH, "user:pass");
    let registry = started(&connector, config).await;
    registry.register(&echo_provider(12200)).await.unwrap();
}

#[tokio::test]
async fn test_unregister_errors_suppressed_while_shutting_down() {
    let connector = MemoryConnector::new();
    let shutdown = ShutdownFlag::new();
    let context = RegistryContext {
        shutdown: shutdown.clone(),
        ..context(&connector)
    };
    let registry = CoordinationRegistry::new(RegistryConfig::zookeeper(ADDRESS), context);
    registry.init().await.unwrap();
    registry.start().await.unwrap();

    let first = echo_provider(12200);
    let second = echo_provider(12201);
    registry.register(&first).await.unwrap();
    registry.register(&second).await.unwrap();

    last_client(&connector).simulate_disconnect();
    assert!(matches!(
        registry.unregister(&first).await,
        Err(RegistryError::Operation {
            source: CoordinationError::ConnectionLoss,
            ..
        })
    ));

    shutdown.shutdown();
    assert!(registry.unregister(&second).await.is_ok());
    registry.destroy().await;
}

#[tokio::test]
async fn test_published_event_carries_every_server() {
    let connector = MemoryConnector::new();
    let event_bus = EventBus::default();
    let mut published = event_bus
        .subscribe_event_type(EventKind::ProviderPublished, "test-observer")
        .expect("Failed to subscribe");
    let context = RegistryContext {
        event_bus: Some(event_bus.clone()),
        ..context(&connector)
    };
    let registry = CoordinationRegistry::new(RegistryConfig::zookeeper(ADDRESS), context);
    registry.init().await.unwrap();
    assert!(registry.start().await.unwrap());

    let provider = echo_provider(12200).with_server(ServerConfig::new("bolt", "127.0.0.1", 12201));
    registry.register(&provider).await.unwrap();

    let event = timeout(Duration::from_secs(1), published.next())
        .await
        .expect("Timeout waiting for event")
        .expect("Stream ended unexpectedly")
        .expect("Event stream error");
    assert_eq!(event.app_name, "echo-server");
    assert_eq!(event.urls.len(), 2);
    assert!(timeout(Duration::from_millis(100), published.next()).await.is_err());
}

#[tokio::test]
async fn test_default_factory_dials_real_ensemble() {
    // 默认上下文连接真实集群，这里的地址上没有服务
    let factory = RegistryFactory::new(RegistryContext::default());
    let registry = factory
        .create(RegistryConfig {
            connect_timeout_ms: 300,
            ..RegistryConfig::zookeeper("127.0.0.1:1/rpc")
        })
        .unwrap();

    registry.init().await.unwrap();
    assert!(registry.start().await.is_err());
    assert!(matches!(
        registry.register(&echo_provider(12200)).await,
        Err(RegistryError::BackendUnavailable(_))
    ));
    registry.destroy().await;
}
