use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::services::model::{ListenerError, ProviderGroup, ProviderInfoListener, ServiceKey};

/// 调用一次外部监听器，错误和 panic 都只记录日志，不影响后续监听器
pub(crate) fn isolate<F>(target: &str, subscriber: Uuid, deliver: F) -> bool
where
    F: FnOnce() -> Result<(), ListenerError>,
{
    match catch_unwind(AssertUnwindSafe(deliver)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(
                target_key = %target,
                subscriber = %subscriber,
                error = %e,
                "Listener failed to handle update"
            );
            false
        }
        Err(_) => {
            tracing::error!(
                target_key = %target,
                subscriber = %subscriber,
                "Listener panicked while handling update"
            );
            false
        }
    }
}

type ListenerEntry = (Uuid, Arc<dyn ProviderInfoListener>);

/// 按服务 key 把分组推送给所有订阅者
///
/// 同步投递，按加入顺序；投递前先对监听器列表做快照，因此增删监听器与投递可以并发。
#[derive(Default)]
pub struct NotificationDispatcher {
    listeners: DashMap<ServiceKey, Vec<ListenerEntry>>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("keys", &self.listeners.len())
            .finish()
    }
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一订阅者重复加入时只保留一份
    pub fn add_listener(
        &self,
        key: &ServiceKey,
        subscriber: Uuid,
        listener: Arc<dyn ProviderInfoListener>,
    ) {
        let mut entry = self.listeners.entry(key.clone()).or_default();
        if !entry.iter().any(|(id, _)| *id == subscriber) {
            entry.push((subscriber, listener));
        }
    }

    /// 返回该 key 是否已经没有订阅者
    pub fn remove_listener(&self, key: &ServiceKey, subscriber: Uuid) -> bool {
        if let Some(mut entry) = self.listeners.get_mut(key) {
            entry.retain(|(id, _)| *id != subscriber);
        }
        self.listeners.remove_if(key, |_, listeners| listeners.is_empty());
        !self.listeners.contains_key(key)
    }

    pub fn has_listeners(&self, key: &ServiceKey) -> bool {
        self.listeners.contains_key(key)
    }

    pub fn listener_count(&self, key: &ServiceKey) -> usize {
        self.listeners.get(key).map(|l| l.len()).unwrap_or(0)
    }

    /// 返回成功投递的监听器数量
    pub fn notify(&self, key: &ServiceKey, group: &ProviderGroup) -> usize {
        let snapshot: Vec<ListenerEntry> = match self.listeners.get(key) {
            Some(entry) => entry.value().clone(),
            None => return 0,
        };

        tracing::debug!(
            service_key = %key,
            providers = group.len(),
            listeners = snapshot.len(),
            "Dispatching provider group"
        );

        snapshot
            .iter()
            .filter(|(subscriber, listener)| {
                isolate(key.as_str(), *subscriber, || listener.update_providers(group))
            })
            .count()
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }
}
