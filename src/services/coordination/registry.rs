use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::client::{
    ClientSettings, ConnectionState, Connector, CoordinationClient, CoordinationError, CreateMode,
};
use super::helper::{self, CONFIGS, CONSUMERS, OVERRIDES, PROVIDERS};
use super::mirror::{MirrorArena, MirrorListener, PathMirror};
use super::observer::ObserverHub;
use crate::config::{PARAM_CREATE_EPHEMERAL, PARAM_PREFER_LOCAL_FILE, RegistryConfig};
use crate::services::event::{EventBus, EventKind, RegistryEvent};
use crate::services::model::{ConsumerConfig, ProviderConfig, ProviderGroup};
use crate::services::registry::{
    Lifecycle, NotificationDispatcher, Registry, RegistryContext, RegistryError, RegistryState,
    ShutdownFlag,
};

// 某次发布实际创建的节点，重连后按它重放
#[derive(Debug, Clone)]
struct ProviderRegistration {
    interface: String,
    online: bool,
    paths: Vec<String>,
}

#[derive(Debug, Clone)]
struct ConsumerRegistration {
    interface: String,
    path: String,
}

// 消费者持有的三个镜像
#[derive(Debug, Clone)]
struct ConsumerWatch {
    service_path: String,
    providers: String,
    configs: String,
    overrides: String,
}

/// 基于层次化协调服务的注册中心
///
/// 节点布局：`<root><接口>/{providers,consumers,configs,overrides}/<编码后的 url>`。
/// 发布和订阅成功后记录在旁路表里，连接恢复（`Reconnected`）时全量重放，
/// 已存在的节点视为成功。
pub struct CoordinationRegistry {
    config: RegistryConfig,
    inner: Arc<CoordinationInner>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    init_lock: tokio::sync::Mutex<()>,
}

struct CoordinationInner {
    connector: Arc<dyn Connector>,
    client: OnceLock<Arc<dyn CoordinationClient>>,
    root: OnceLock<String>,
    ephemeral: bool,
    prefer_local_file: bool,
    connect_timeout: Duration,
    // 旁路表：配置 id -> 已创建的节点
    provider_urls: DashMap<Uuid, ProviderRegistration>,
    consumer_urls: DashMap<Uuid, ConsumerRegistration>,
    // provider 配置订阅：配置 id -> configs 路径
    config_watches: DashMap<Uuid, String>,
    consumer_watches: DashMap<Uuid, ConsumerWatch>,
    arena: MirrorArena,
    hub: Arc<ObserverHub>,
    dispatcher: Arc<NotificationDispatcher>,
    lifecycle: Lifecycle,
    shutdown: ShutdownFlag,
    event_bus: Option<EventBus>,
}

impl fmt::Debug for CoordinationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinationRegistry")
            .field("address", &self.config.address)
            .field("root", &self.inner.root.get())
            .field("state", &self.inner.lifecycle.state())
            .field("providers", &self.inner.provider_urls.len())
            .field("consumers", &self.inner.consumer_urls.len())
            .finish_non_exhaustive()
    }
}

impl CoordinationRegistry {
    pub fn new(config: RegistryConfig, context: RegistryContext) -> Self {
        let dispatcher = Arc::new(NotificationDispatcher::new());
        let inner = CoordinationInner {
            connector: context.connector,
            client: OnceLock::new(),
            root: OnceLock::new(),
            ephemeral: config.bool_parameter(PARAM_CREATE_EPHEMERAL, true),
            prefer_local_file: config.bool_parameter(PARAM_PREFER_LOCAL_FILE, true),
            connect_timeout: config.connect_timeout(),
            provider_urls: DashMap::new(),
            consumer_urls: DashMap::new(),
            config_watches: DashMap::new(),
            consumer_watches: DashMap::new(),
            arena: MirrorArena::new(),
            hub: Arc::new(ObserverHub::new(dispatcher.clone())),
            dispatcher,
            lifecycle: Lifecycle::default(),
            shutdown: context.shutdown,
            event_bus: context.event_bus,
        };

        Self {
            config,
            inner: Arc::new(inner),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> RegistryState {
        self.inner.lifecycle.state()
    }

    /// 规范化后的根路径，init 之前为 None
    pub fn root(&self) -> Option<&str> {
        self.inner.root.get().map(String::as_str)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.inner.ephemeral
    }

    pub fn prefers_local_file(&self) -> bool {
        self.inner.prefer_local_file
    }

    /// 该配置当前记录在旁路表中的节点
    pub fn provider_node_paths(&self, config: &ProviderConfig) -> Vec<String> {
        self.inner
            .provider_urls
            .get(&config.id())
            .map(|r| r.paths.clone())
            .unwrap_or_default()
    }

    pub fn consumer_node_path(&self, config: &ConsumerConfig) -> Option<String> {
        self.inner
            .consumer_urls
            .get(&config.id())
            .map(|r| r.path.clone())
    }

    /// 只改写节点数据，订阅方看到的是更新事件而不是删除再新增
    pub async fn set_provider_online(
        &self,
        config: &ProviderConfig,
        online: bool,
    ) -> Result<(), RegistryError> {
        self.inner.lifecycle.ensure_alive()?;
        let registration = match self.inner.provider_urls.get_mut(&config.id()) {
            Some(mut registration) => {
                registration.online = online;
                registration.clone()
            }
            None => {
                return Err(RegistryError::Configuration(format!(
                    "provider {} is not registered",
                    config.interface
                )));
            }
        };

        let client = self.inner.client()?;
        for path in &registration.paths {
            self.inner
                .call(client.set_data(path, helper::status_data(online)))
                .await
                .map_err(|e| RegistryError::operation("set provider status", &config.interface, e))?;
        }
        tracing::info!(
            interface = %config.interface,
            online = online,
            nodes = registration.paths.len(),
            "Provider status changed"
        );
        Ok(())
    }

    /// 立即重放旁路表，与收到重连事件时相同
    pub async fn recover_registry_data(&self) -> Result<(), RegistryError> {
        self.inner.lifecycle.ensure_alive()?;
        self.inner.recover_registry_data().await;
        Ok(())
    }

    fn spawn_recovery_task(&self, mut states: broadcast::Receiver<ConnectionState>) {
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            loop {
                let state = tokio::select! {
                    _ = cancel.cancelled() => break,
                    state = states.recv() => state,
                };
                match state {
                    Ok(ConnectionState::Reconnected) => {
                        tracing::info!("Reconnected to coordination service, recover provider and consumer data");
                        inner.recover_registry_data().await;
                    }
                    Ok(state) => {
                        tracing::debug!(state = ?state, "Coordination connection state changed");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // 丢失的状态里可能有重连，直接重放
                        tracing::warn!(skipped = skipped, "Connection state events lagged");
                        inner.recover_registry_data().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Coordination recovery task stopped");
        });
    }
}

impl CoordinationInner {
    fn client(&self) -> Result<Arc<dyn CoordinationClient>, RegistryError> {
        self.client.get().cloned().ok_or_else(|| {
            RegistryError::BackendUnavailable("coordination registry not initialized".to_string())
        })
    }

    fn root(&self) -> &str {
        self.root.get().map(String::as_str).unwrap_or("/")
    }

    fn mode(&self) -> CreateMode {
        if self.ephemeral {
            CreateMode::Ephemeral
        } else {
            CreateMode::Persistent
        }
    }

    /// 远端调用统一受连接超时约束
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, CoordinationError>>,
    ) -> Result<T, CoordinationError> {
        tokio::time::timeout(self.connect_timeout, fut)
            .await
            .unwrap_or_else(|_| Err(CoordinationError::Timeout))
    }

    /// 节点已存在视为成功
    async fn create_node(
        &self,
        client: &Arc<dyn CoordinationClient>,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<(), CoordinationError> {
        match self.call(client.create(path, data, mode)).await {
            Ok(()) => Ok(()),
            Err(CoordinationError::NodeExists(_)) => {
                tracing::warn!(path = %path, "Node already exists in coordination service");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 节点不存在视为成功
    async fn delete_node(
        &self,
        client: &Arc<dyn CoordinationClient>,
        path: &str,
    ) -> Result<(), CoordinationError> {
        match self.call(client.delete(path)).await {
            Ok(()) => Ok(()),
            Err(CoordinationError::NoNode(_)) => {
                tracing::warn!(path = %path, "Node already removed from coordination service");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn provider_registration(&self, config: &ProviderConfig) -> ProviderRegistration {
        if let Some(existing) = self.provider_urls.get(&config.id()) {
            return existing.clone();
        }
        let providers_path = helper::subtree_path(self.root(), &config.interface, PROVIDERS);
        ProviderRegistration {
            interface: config.interface.clone(),
            online: config.dynamic,
            paths: config
                .provider_infos()
                .iter()
                .map(|(_, provider)| helper::node_path(&providers_path, provider))
                .collect(),
        }
    }

    async fn register_provider_urls(
        &self,
        registration: &ProviderRegistration,
    ) -> Result<(), RegistryError> {
        let client = self.client()?;
        let mode = self.mode();
        for path in &registration.paths {
            self.create_node(&client, path, helper::status_data(registration.online), mode)
                .await
                .map_err(|e| RegistryError::operation("register provider", &registration.interface, e))?;
            tracing::info!(path = %path, "Published provider node");
        }
        Ok(())
    }

    async fn subscribe_consumer_url(
        &self,
        registration: &ConsumerRegistration,
    ) -> Result<(), RegistryError> {
        let client = self.client()?;
        // 消费者节点总是临时节点
        self.create_node(&client, &registration.path, Vec::new(), CreateMode::Ephemeral)
            .await
            .map_err(|e| RegistryError::operation("register consumer", &registration.interface, e))
    }

    async fn recover_registry_data(&self) {
        let providers: Vec<ProviderRegistration> =
            self.provider_urls.iter().map(|r| r.value().clone()).collect();
        let consumers: Vec<ConsumerRegistration> =
            self.consumer_urls.iter().map(|r| r.value().clone()).collect();

        tracing::info!(
            providers = providers.len(),
            consumers = consumers.len(),
            "Replaying registry data"
        );
        for registration in &providers {
            if let Err(e) = self.register_provider_urls(registration).await {
                tracing::error!(interface = %registration.interface, error = %e, "Failed to recover provider");
            }
        }
        for registration in &consumers {
            if let Err(e) = self.subscribe_consumer_url(registration).await {
                tracing::error!(interface = %registration.interface, error = %e, "Failed to recover consumer");
            }
        }
    }

    async fn acquire(
        &self,
        client: &Arc<dyn CoordinationClient>,
        path: &str,
        interface: &str,
    ) -> Result<Arc<PathMirror>, RegistryError> {
        let listener: Arc<dyn MirrorListener> = self.hub.clone();
        self.call(self.arena.acquire(client, path, listener))
            .await
            .map_err(|e| RegistryError::operation("watch", interface, e))
    }

    async fn release(&self, path: &str) {
        if self.arena.release(path).await {
            self.hub.configs.forget(path);
            tracing::debug!(path = %path, "Closed path mirror");
        }
    }

    async fn subscribe_provider_config(&self, config: &ProviderConfig) -> Result<(), RegistryError> {
        if self.config_watches.contains_key(&config.id()) {
            return Ok(());
        }
        let client = self.client()?;
        let path = helper::subtree_path(self.root(), &config.interface, CONFIGS);
        let mirror = self.acquire(&client, &path, &config.interface).await?;

        if self.config_watches.insert(config.id(), path.clone()).is_some() {
            // 并发的重复注册，退回多拿的引用
            self.release(&path).await;
            return Ok(());
        }
        if let Some(listener) = &config.config_listener {
            self.hub
                .configs
                .add_listener(&path, config.id(), listener.clone(), &mirror.current_data());
        }
        Ok(())
    }

    async fn unsubscribe_provider_config(&self, config: &ProviderConfig) {
        if let Some((_, path)) = self.config_watches.remove(&config.id()) {
            self.hub.configs.remove_listener(&path, config.id());
            self.release(&path).await;
        }
    }

    /// 依次建立 configs、overrides、providers 三个镜像，失败时释放已建立的
    async fn watch_consumer(&self, config: &ConsumerConfig) -> Result<ConsumerWatch, RegistryError> {
        let client = self.client()?;
        let root = self.root();
        let watch = ConsumerWatch {
            service_path: helper::service_path(root, &config.interface),
            providers: helper::subtree_path(root, &config.interface, PROVIDERS),
            configs: helper::subtree_path(root, &config.interface, CONFIGS),
            overrides: helper::subtree_path(root, &config.interface, OVERRIDES),
        };

        let configs = self.acquire(&client, &watch.configs, &config.interface).await?;
        let overrides = match self.acquire(&client, &watch.overrides, &config.interface).await {
            Ok(mirror) => mirror,
            Err(e) => {
                self.release(&watch.configs).await;
                return Err(e);
            }
        };
        let providers = match self.acquire(&client, &watch.providers, &config.interface).await {
            Ok(mirror) => mirror,
            Err(e) => {
                self.release(&watch.configs).await;
                self.release(&watch.overrides).await;
                return Err(e);
            }
        };

        if let Some(listener) = &config.config_listener {
            self.hub
                .configs
                .add_listener(&watch.configs, config.id(), listener.clone(), &configs.current_data());
        }
        self.hub
            .overrides
            .add_subscriber(&watch.service_path, config, &overrides.current_data());
        self.hub
            .providers
            .add_consumer(&watch.providers, config, providers.current_data());
        Ok(watch)
    }

    async fn unwatch_consumer(&self, config: &ConsumerConfig, watch: &ConsumerWatch) {
        self.hub.providers.remove_consumer(&watch.providers, config);
        self.hub.configs.remove_listener(&watch.configs, config.id());
        self.hub
            .overrides
            .remove_subscriber(&watch.service_path, config.id());
        self.release_mirrors(watch).await;
    }

    async fn release_mirrors(&self, watch: &ConsumerWatch) {
        for path in [&watch.providers, &watch.configs, &watch.overrides] {
            self.release(path).await;
        }
    }

    fn post(&self, event: RegistryEvent) {
        if let Some(bus) = &self.event_bus {
            bus.post(event);
        }
    }
}

#[async_trait]
impl Registry for CoordinationRegistry {
    fn config(&self) -> &RegistryConfig {
        &self.config
    }

    async fn init(&self) -> Result<(), RegistryError> {
        let _guard = self.init_lock.lock().await;
        if self.inner.lifecycle.ensure_alive()? != RegistryState::Uninitialized {
            return Ok(());
        }

        let address = self
            .config
            .address
            .as_deref()
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .ok_or_else(|| {
                RegistryError::Configuration("coordination registry address is empty".to_string())
            })?;
        let (connect_string, root) = helper::split_address(address);
        let settings = ClientSettings {
            connect_string,
            session_timeout: self.config.session_timeout(),
            connect_timeout: self.config.connect_timeout(),
            auth: helper::build_auth_info(&self.config),
        };

        let client = self
            .inner
            .connector
            .connect(&settings)
            .map_err(|e| RegistryError::BackendUnavailable(e.to_string()))?;
        // 先订阅状态再启动任务，避免漏掉早期的重连事件
        let states = client.connection_states();
        let _ = self.inner.client.set(client);
        let _ = self.inner.root.set(root);
        self.spawn_recovery_task(states);
        self.inner.lifecycle.set(RegistryState::Initialized);

        tracing::info!(
            address = %settings.connect_string,
            root = %self.inner.root(),
            prefer_local_file = self.inner.prefer_local_file,
            ephemeral = self.inner.ephemeral,
            "Init coordination registry"
        );
        Ok(())
    }

    async fn start(&self) -> Result<bool, RegistryError> {
        match self.inner.lifecycle.ensure_alive()? {
            RegistryState::Uninitialized => {
                tracing::warn!("Start coordination registry must be do init first!");
                Ok(false)
            }
            RegistryState::Started => Ok(true),
            _ => {
                let client = self.inner.client()?;
                let address = self.config.address.clone().unwrap_or_default();
                self.inner
                    .call(client.start())
                    .await
                    .map_err(|e| RegistryError::operation("start client", address, e))?;
                self.inner.lifecycle.set(RegistryState::Started);
                Ok(client.is_started())
            }
        }
    }

    async fn register(&self, config: &ProviderConfig) -> Result<(), RegistryError> {
        self.inner.lifecycle.ensure_alive()?;
        if !self.config.register {
            tracing::info!(interface = %config.interface, "Registry ignores register request");
            return Ok(());
        }

        if config.register {
            let registration = self.inner.provider_registration(config);
            if !registration.paths.is_empty() {
                self.inner.register_provider_urls(&registration).await?;
                self.inner.provider_urls.insert(config.id(), registration);

                // 每个配置只发一次事件
                let infos = config.provider_infos();
                if let Some((key, _)) = infos.first() {
                    let urls = infos.iter().map(|(_, provider)| provider.to_url()).collect();
                    self.inner.post(
                        RegistryEvent::new(EventKind::ProviderPublished, key.clone(), &config.app_name)
                            .with_urls(urls),
                    );
                }
            }
        }
        if config.subscribe {
            self.inner.subscribe_provider_config(config).await?;
        }
        Ok(())
    }

    async fn unregister(&self, config: &ProviderConfig) -> Result<(), RegistryError> {
        self.inner.lifecycle.ensure_alive()?;
        if !self.config.register {
            tracing::info!(interface = %config.interface, "Registry ignores unregister request");
            return Ok(());
        }

        if config.register {
            if let Some((_, registration)) = self.inner.provider_urls.remove(&config.id()) {
                let result = async {
                    let client = self.inner.client()?;
                    for path in &registration.paths {
                        self.inner
                            .delete_node(&client, path)
                            .await
                            .map_err(|e| RegistryError::operation("unregister provider", &config.interface, e))?;
                    }
                    Ok::<_, RegistryError>(())
                }
                .await;

                match result {
                    Ok(()) => tracing::info!(
                        interface = %config.interface,
                        nodes = registration.paths.len(),
                        "Unpublished provider"
                    ),
                    Err(e) if self.inner.shutdown.is_shutting_down() => {
                        tracing::debug!(error = %e, "Ignore unregister failure while shutting down");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if config.subscribe {
            self.inner.unsubscribe_provider_config(config).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        config: &ConsumerConfig,
    ) -> Result<Option<Vec<ProviderGroup>>, RegistryError> {
        self.inner.lifecycle.ensure_alive()?;
        if !self.config.subscribe {
            tracing::info!(interface = %config.interface, "Registry ignores subscribe request");
            return Ok(None);
        }

        if config.register {
            let registration = match self.inner.consumer_urls.get(&config.id()) {
                Some(existing) => existing.clone(),
                None => {
                    let consumers_path =
                        helper::subtree_path(self.inner.root(), &config.interface, CONSUMERS);
                    ConsumerRegistration {
                        interface: config.interface.clone(),
                        path: helper::node_path(&consumers_path, &config.consumer_info()),
                    }
                }
            };
            self.inner.subscribe_consumer_url(&registration).await?;
            self.inner.consumer_urls.insert(config.id(), registration);
        }
        if !config.subscribe {
            return Ok(None);
        }

        let existing = self
            .inner
            .consumer_watches
            .get(&config.id())
            .map(|watch| watch.providers.clone());
        let providers_path = match existing {
            Some(providers_path) => providers_path,
            None => {
                let watch = self.inner.watch_consumer(config).await?;
                let providers_path = watch.providers.clone();
                if let Some(duplicate) = self.inner.consumer_watches.insert(config.id(), watch) {
                    // 并发的重复订阅，观察者按 id 去重，只退回多拿的镜像引用
                    self.inner.release_mirrors(&duplicate).await;
                }
                tracing::info!(path = %providers_path, "Subscribed provider subtree");
                providers_path
            }
        };

        let group = self.inner.hub.providers.matched_group(&providers_path, config);
        self.inner.post(RegistryEvent::new(
            EventKind::ConsumerSubscribed,
            config.service_key(),
            &config.app_name,
        ));
        Ok(Some(vec![group]))
    }

    async fn unsubscribe(&self, config: &ConsumerConfig) -> Result<(), RegistryError> {
        self.inner.lifecycle.ensure_alive()?;

        if config.register {
            if let Some((_, registration)) = self.inner.consumer_urls.remove(&config.id()) {
                let result = match self.inner.client() {
                    Ok(client) => self
                        .inner
                        .delete_node(&client, &registration.path)
                        .await
                        .map_err(|e| RegistryError::operation("unregister consumer", &config.interface, e)),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {}
                    Err(e) if self.inner.shutdown.is_shutting_down() => {
                        tracing::debug!(error = %e, "Ignore unsubscribe failure while shutting down");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if let Some((_, watch)) = self.inner.consumer_watches.remove(&config.id()) {
            self.inner.unwatch_consumer(config, &watch).await;
        }
        tracing::info!(service_key = %config.service_key(), "Unsubscribed service");
        Ok(())
    }

    async fn destroy(&self) {
        if self.inner.lifecycle.destroy() == RegistryState::Destroyed {
            return;
        }

        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        self.inner.arena.close_all().await;
        if let Some(client) = self.inner.client.get() {
            client.close().await;
        }
        self.inner.provider_urls.clear();
        self.inner.consumer_urls.clear();
        self.inner.config_watches.clear();
        self.inner.consumer_watches.clear();
        self.inner.hub.clear();
        self.inner.dispatcher.clear();
        tracing::info!("Coordination registry destroyed");
    }
}
