use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::backup::{self, BackupError};
use crate::config::{PARAM_LOCAL_PRUNE_EMPTY, RegistryConfig};
use crate::services::event::{EventBus, EventKind, RegistryEvent};
use crate::services::model::{
    ConsumerConfig, MappingDiff, ProviderConfig, ProviderGroup, ProviderInfo, ProviderMapping,
    ServiceKey,
};
use crate::services::registry::{
    Lifecycle, NotificationDispatcher, Registry, RegistryContext, RegistryError, RegistryState,
};

/// 一次对账的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 文件内容未变化（或文件不存在），没有重新加载
    Unchanged,
    /// 重新加载了文件，并通知了若干个变化的服务 key
    Reloaded { dispatched: usize },
}

/// 基于本地文件的注册中心
///
/// 内存中维护 服务key -> 分组 的映射，注册/反注册立即落盘；后台任务按固定延迟对账：
/// 先把脏数据写回文件，再比较文件摘要，摘要变化时重新加载并把差异通知给订阅者。
#[derive(Debug)]
pub struct LocalRegistry {
    config: RegistryConfig,
    inner: Arc<LocalInner>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    init_lock: tokio::sync::Mutex<()>,
}

#[derive(Debug)]
struct LocalInner {
    file: OnceLock<PathBuf>,
    memory_cache: DashMap<ServiceKey, ProviderGroup>,
    // 内存有未落盘的修改
    needs_backup: AtomicBool,
    last_digest: Mutex<Option<String>>,
    // 串行化文件读写
    file_lock: Mutex<()>,
    dispatcher: NotificationDispatcher,
    subscribe: bool,
    prune_empty: bool,
    lifecycle: Lifecycle,
    event_bus: Option<EventBus>,
}

impl LocalRegistry {
    pub fn new(config: RegistryConfig, context: RegistryContext) -> Self {
        let inner = LocalInner {
            file: OnceLock::new(),
            memory_cache: DashMap::new(),
            needs_backup: AtomicBool::new(false),
            last_digest: Mutex::new(None),
            file_lock: Mutex::new(()),
            dispatcher: NotificationDispatcher::new(),
            subscribe: config.subscribe,
            prune_empty: config.bool_parameter(PARAM_LOCAL_PRUNE_EMPTY, false),
            lifecycle: Lifecycle::default(),
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

    /// 当前内存中某个服务 key 的分组
    pub fn provider_group(&self, key: &ServiceKey) -> Option<ProviderGroup> {
        self.inner.memory_cache.get(key).map(|group| group.clone())
    }

    pub fn service_keys(&self) -> Vec<ServiceKey> {
        self.inner
            .memory_cache
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// 立即执行一次对账，会阻塞当前线程做文件读写
    pub fn reconcile(&self) -> Result<ReconcileOutcome, RegistryError> {
        self.inner.lifecycle.ensure_alive()?;
        Ok(self.inner.reconcile()?)
    }

    fn spawn_reconcile_task(&self, period: Duration) {
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            loop {
                // 固定延迟：上一次对账结束后才开始计时
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                // 文件读写放到阻塞线程池
                let tick = inner.clone();
                match tokio::task::spawn_blocking(move || tick.reconcile()).await {
                    Ok(Ok(ReconcileOutcome::Reloaded { dispatched })) => {
                        tracing::debug!(dispatched = dispatched, "Registry backup file reloaded");
                    }
                    Ok(Ok(ReconcileOutcome::Unchanged)) => {}
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "Local registry reconcile tick failed");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Local registry reconcile tick panicked");
                    }
                }
            }
            tracing::debug!("Local registry reconcile task stopped");
        });
    }
}

impl LocalInner {
    fn file(&self) -> Result<&Path, RegistryError> {
        self.file
            .get()
            .map(PathBuf::as_path)
            .ok_or_else(|| RegistryError::BackendUnavailable("local registry not initialized".to_string()))
    }

    fn snapshot(&self) -> ProviderMapping {
        self.memory_cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn write_backup_if_needed(&self) -> Result<bool, RegistryError> {
        let file = self.file()?;
        let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_backup_locked(file)
    }

    /// 有脏数据时写文件，失败时保留脏标记等下次重试；调用方持有 file_lock
    fn write_backup_locked(&self, file: &Path) -> Result<bool, RegistryError> {
        if !self.needs_backup.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        match backup::write(file, &self.snapshot()) {
            Ok(digest) => {
                // 自己写入的内容不触发重新加载
                *self.last_digest.lock().unwrap_or_else(PoisonError::into_inner) = Some(digest);
                Ok(true)
            }
            Err(e) => {
                self.needs_backup.store(true, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    fn reconcile(&self) -> Result<ReconcileOutcome, BackupError> {
        if let Err(e) = self.write_backup_if_needed() {
            // 写失败时不做加载，避免用旧文件覆盖未落盘的修改
            tracing::warn!(error = %e, "Skip reload because backup write failed");
            return Ok(ReconcileOutcome::Unchanged);
        }
        if !self.subscribe {
            return Ok(ReconcileOutcome::Unchanged);
        }
        let Ok(file) = self.file() else {
            return Ok(ReconcileOutcome::Unchanged);
        };

        let notifications = {
            let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
            match self.reload_locked(file)? {
                Some(diff) => diff,
                None => return Ok(ReconcileOutcome::Unchanged),
            }
        };

        // 锁外通知，监听器里可以再调用注册中心
        let dispatched = notifications.len();
        for (key, group) in notifications.notifications() {
            self.dispatcher.notify(key, group);
        }
        Ok(ReconcileOutcome::Reloaded { dispatched })
    }

    /// 摘要变化时重新加载文件并替换内存；调用方持有 file_lock
    fn reload_locked(&self, file: &Path) -> Result<Option<MappingDiff>, BackupError> {
        let Some(digest) = backup::checksum(file)? else {
            return Ok(None);
        };
        let last = self
            .last_digest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if last.as_deref() == Some(digest.as_str()) {
            return Ok(None);
        }

        let reloaded = backup::load(file)?;
        let diff = self.replace_cache(reloaded);
        *self.last_digest.lock().unwrap_or_else(PoisonError::into_inner) = Some(digest);
        Ok(Some(diff))
    }

    /// 用新映射替换内存，返回差异
    fn replace_cache(&self, reloaded: ProviderMapping) -> MappingDiff {
        let diff = MappingDiff::between(&self.snapshot(), &reloaded);
        for (key, _) in &diff.removed {
            self.memory_cache.remove(key);
        }
        for (key, group) in diff.added.iter().chain(diff.changed.iter()) {
            self.memory_cache.insert(key.clone(), group.clone());
        }
        diff
    }

    fn load_initial_cache(&self) -> Result<(), RegistryError> {
        let file = self.file()?;
        let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let loaded = backup::load_or_empty(file);
        tracing::info!(
            file = %file.display(),
            services = loaded.len(),
            "Loaded local registry backup"
        );
        self.replace_cache(loaded);
        let digest = backup::checksum(file).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to checksum registry backup file");
            None
        });
        *self.last_digest.lock().unwrap_or_else(PoisonError::into_inner) = digest;
        Ok(())
    }

    /// 在 file_lock 内修改内存并落盘，重新加载不会覆盖这次修改；通知在锁外
    fn mutate_and_persist(
        &self,
        key: &ServiceKey,
        mutate: impl FnOnce(&DashMap<ServiceKey, ProviderGroup>) -> Option<ProviderGroup>,
    ) -> Result<Option<ProviderGroup>, RegistryError> {
        let file = self.file()?;
        let group = {
            let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(group) = mutate(&self.memory_cache) else {
                return Ok(None);
            };
            self.needs_backup.store(true, Ordering::SeqCst);
            if let Err(e) = self.write_backup_locked(file) {
                tracing::warn!(
                    service_key = %key,
                    error = %e,
                    "Failed to write registry backup, will retry on next tick"
                );
            }
            group
        };

        if self.subscribe {
            self.dispatcher.notify(key, &group);
        }
        Ok(Some(group))
    }

    fn do_register(&self, key: &ServiceKey, provider: ProviderInfo) -> Result<(), RegistryError> {
        tracing::info!(service_key = %key, provider = %provider, "Publishing provider");
        let changed = self.mutate_and_persist(key, |cache| {
            let mut group = cache.entry(key.clone()).or_default();
            group.add(provider).then(|| group.clone())
        })?;
        if changed.is_none() {
            tracing::debug!(service_key = %key, "Provider already registered");
        }
        Ok(())
    }

    fn do_unregister(&self, key: &ServiceKey, provider: &ProviderInfo) -> Result<(), RegistryError> {
        let changed = self.mutate_and_persist(key, |cache| {
            let mut group = cache.get_mut(key)?;
            group.remove(provider).then(|| group.clone())
        })?;
        if changed.is_some() {
            tracing::info!(service_key = %key, provider = %provider, "Unpublished provider");
        }
        Ok(())
    }

    fn post(&self, event: RegistryEvent) {
        if let Some(bus) = &self.event_bus {
            bus.post(event);
        }
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    fn config(&self) -> &RegistryConfig {
        &self.config
    }

    async fn init(&self) -> Result<(), RegistryError> {
        let _guard = self.init_lock.lock().await;
        if self.inner.lifecycle.ensure_alive()? != RegistryState::Uninitialized {
            return Ok(());
        }

        let file = self.config.file.clone().ok_or_else(|| {
            RegistryError::Configuration("local registry requires a backing file".to_string())
        })?;
        let _ = self.inner.file.set(file);

        if self.inner.subscribe {
            let inner = self.inner.clone();
            tokio::task::spawn_blocking(move || inner.load_initial_cache()).await??;
        }

        let period = self.config.scan_period();
        self.spawn_reconcile_task(period);
        self.inner.lifecycle.set(RegistryState::Initialized);

        tracing::info!(
            file = ?self.config.file,
            scan_period_ms = period.as_millis() as u64,
            "Local registry initialized"
        );
        Ok(())
    }

    async fn start(&self) -> Result<bool, RegistryError> {
        match self.inner.lifecycle.ensure_alive()? {
            RegistryState::Uninitialized => {
                tracing::warn!("Start local registry must be do init first!");
                Ok(false)
            }
            _ => {
                self.inner.lifecycle.set(RegistryState::Started);
                Ok(true)
            }
        }
    }

    async fn register(&self, config: &ProviderConfig) -> Result<(), RegistryError> {
        self.inner.lifecycle.ensure_alive()?;
        self.inner.file()?;
        if !self.config.register {
            tracing::info!(interface = %config.interface, "Registry ignores register request");
            return Ok(());
        }
        if !config.register {
            return Ok(());
        }

        let infos = config.provider_infos();
        let Some(key) = infos.first().map(|(key, _)| key.clone()) else {
            return Ok(());
        };
        let inner = self.inner.clone();
        let urls = tokio::task::spawn_blocking(move || {
            let mut urls = Vec::with_capacity(infos.len());
            for (key, provider) in infos {
                urls.push(provider.to_url());
                inner.do_register(&key, provider)?;
            }
            Ok::<_, RegistryError>(urls)
        })
        .await??;

        // 每个配置只发一次事件
        self.inner.post(
            RegistryEvent::new(EventKind::ProviderPublished, key, &config.app_name).with_urls(urls),
        );
        Ok(())
    }

    async fn unregister(&self, config: &ProviderConfig) -> Result<(), RegistryError> {
        self.inner.lifecycle.ensure_alive()?;
        self.inner.file()?;
        if !self.config.register {
            tracing::info!(interface = %config.interface, "Registry ignores unregister request");
            return Ok(());
        }
        if !config.register {
            return Ok(());
        }

        let infos = config.provider_infos();
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            infos
                .iter()
                .try_for_each(|(key, provider)| inner.do_unregister(key, provider))
        })
        .await?
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

        let key = config.service_key();
        if let Some(listener) = &config.provider_listener {
            self.inner
                .dispatcher
                .add_listener(&key, config.id(), listener.clone());
        }
        // 订阅了但还没有服务端时也要返回空分组
        let group = self
            .inner
            .memory_cache
            .entry(key.clone())
            .or_default()
            .clone();

        tracing::info!(service_key = %key, providers = group.len(), "Subscribed service");
        self.inner.post(RegistryEvent::new(
            EventKind::ConsumerSubscribed,
            key,
            &config.app_name,
        ));
        Ok(Some(vec![group]))
    }

    async fn unsubscribe(&self, config: &ConsumerConfig) -> Result<(), RegistryError> {
        self.inner.lifecycle.ensure_alive()?;
        let key = config.service_key();
        let drained = self.inner.dispatcher.remove_listener(&key, config.id());
        if drained && self.inner.prune_empty {
            self.inner
                .memory_cache
                .remove_if(&key, |_, group| group.is_empty());
        }
        tracing::info!(service_key = %key, "Unsubscribed service");
        Ok(())
    }

    async fn destroy(&self) {
        if self.inner.lifecycle.destroy() == RegistryState::Destroyed {
            return;
        }

        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        if self.inner.file.get().is_some() {
            let inner = self.inner.clone();
            match tokio::task::spawn_blocking(move || inner.write_backup_if_needed()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to flush registry backup on destroy"),
                Err(e) => tracing::warn!(error = %e, "Registry backup flush task failed"),
            }
        }
        self.inner.dispatcher.clear();
        tracing::info!("Local registry destroyed");
    }
}

impl From<BackupError> for RegistryError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::Io { source, .. } => RegistryError::Io(source),
            other => RegistryError::BackendUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn echo_key() -> ServiceKey {
        ServiceKey::from("Echo:1.0@bolt")
    }

    #[test]
    fn test_register_waits_for_reload_and_survives_it() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("registry.toml");
        let registry = LocalRegistry::new(RegistryConfig::local(&file), RegistryContext::default());
        registry.inner.file.set(file.clone()).unwrap();
        let inner = registry.inner.clone();

        // 对账持锁期间，外部进程改写了文件
        let guard = inner.file_lock.lock().unwrap();
        let mut external = ProviderMapping::new();
        external.insert(ServiceKey::from("Other:1.0@bolt"), ProviderGroup::new());
        backup::write(&file, &external).unwrap();

        let provider = ProviderInfo::new("bolt", "10.0.0.1", 22000);
        let worker = {
            let inner = inner.clone();
            let provider = provider.clone();
            thread::spawn(move || inner.do_register(&echo_key(), provider))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(inner.memory_cache.get(&echo_key()).is_none());

        let diff = inner.reload_locked(&file).unwrap().expect("file changed");
        assert_eq!(diff.len(), 1);
        drop(guard);
        worker.join().unwrap().unwrap();

        let group = inner.memory_cache.get(&echo_key()).map(|g| g.clone());
        assert!(group.is_some_and(|g| g.contains(&provider)));
        let persisted = backup::load(&file).unwrap();
        assert!(persisted.get(&echo_key()).is_some_and(|g| g.contains(&provider)));
        assert!(persisted.contains_key(&ServiceKey::from("Other:1.0@bolt")));
    }

    #[test]
    fn test_unregister_unknown_key_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("registry.toml");
        let registry = LocalRegistry::new(RegistryConfig::local(&file), RegistryContext::default());
        registry.inner.file.set(file.clone()).unwrap();

        let provider = ProviderInfo::new("bolt", "10.0.0.1", 22000);
        registry.inner.do_unregister(&echo_key(), &provider).unwrap();
        assert!(!file.exists());
        assert!(!registry.inner.needs_backup.load(Ordering::SeqCst));
    }
}
