use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use super::client::{ChildData, ChildEvent, ChildEventKind};
use super::helper::{self, CONFIGS, OVERRIDES, PROVIDERS};
use super::mirror::MirrorListener;
use crate::services::model::{ConfigListener, ConsumerConfig, ProviderGroup, ProviderInfo};
use crate::services::registry::NotificationDispatcher;
use crate::services::registry::dispatcher::isolate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtreeKind {
    Providers,
    Configs,
    Overrides,
}

impl SubtreeKind {
    /// 拆出子树类型和接口级路径
    pub fn split(path: &str) -> Option<(SubtreeKind, &str)> {
        let (service_path, subtree) = path.rsplit_once('/')?;
        let kind = match subtree {
            PROVIDERS => SubtreeKind::Providers,
            CONFIGS => SubtreeKind::Configs,
            OVERRIDES => SubtreeKind::Overrides,
            _ => return None,
        };
        Some((kind, service_path))
    }
}

type ConfigListenerEntry = (Uuid, Arc<dyn ConfigListener>);

/// 把三类子树的镜像事件分发给对应的观察者
pub struct ObserverHub {
    pub providers: ProviderObserver,
    pub configs: ConfigObserver,
    pub overrides: Arc<OverrideObserver>,
}

impl ObserverHub {
    pub fn new(dispatcher: Arc<NotificationDispatcher>) -> Self {
        let overrides = Arc::new(OverrideObserver::default());
        Self {
            providers: ProviderObserver::new(dispatcher, overrides.clone()),
            configs: ConfigObserver::default(),
            overrides,
        }
    }

    pub fn clear(&self) {
        self.providers.clear();
        self.configs.clear();
        self.overrides.clear();
    }
}

impl MirrorListener for ObserverHub {
    fn child_changed(&self, path: &str, event: &ChildEvent, snapshot: &[ChildData]) {
        tracing::debug!(
            path = %path,
            kind = ?event.kind,
            node = %event.data.name,
            "Receive coordination child event"
        );
        match SubtreeKind::split(path) {
            Some((SubtreeKind::Providers, _)) => self.providers.on_change(path, snapshot),
            Some((SubtreeKind::Configs, _)) => self.configs.on_change(path, snapshot),
            Some((SubtreeKind::Overrides, service_path)) => {
                self.overrides.on_change(service_path, event, snapshot);
                // 覆盖规则变了，重新下发合并后的列表
                self.providers.refresh(&format!("{service_path}/{PROVIDERS}"));
            }
            None => {
                tracing::warn!(path = %path, "Ignore event from unknown subtree");
            }
        }
    }
}

/// providers 子树：计算每个订阅者匹配的端点列表并推送
pub struct ProviderObserver {
    // providers 路径 -> 订阅者
    consumers: DashMap<String, Vec<ConsumerConfig>>,
    snapshots: DashMap<String, Vec<ChildData>>,
    overrides: Arc<OverrideObserver>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl ProviderObserver {
    pub fn new(dispatcher: Arc<NotificationDispatcher>, overrides: Arc<OverrideObserver>) -> Self {
        Self {
            consumers: DashMap::new(),
            snapshots: DashMap::new(),
            overrides,
            dispatcher,
        }
    }

    pub fn add_consumer(&self, path: &str, config: &ConsumerConfig, current: Vec<ChildData>) {
        let mut consumers = self.consumers.entry(path.to_string()).or_default();
        if !consumers.iter().any(|c| c.id() == config.id()) {
            consumers.push(config.clone());
        }
        drop(consumers);

        // 镜像已经有事件写入时以事件为准
        self.snapshots.entry(path.to_string()).or_insert(current);
        if let Some(listener) = &config.provider_listener {
            self.dispatcher
                .add_listener(&config.service_key(), config.id(), listener.clone());
        }
    }

    /// 返回该路径是否已经没有订阅者
    pub fn remove_consumer(&self, path: &str, config: &ConsumerConfig) -> bool {
        self.dispatcher.remove_listener(&config.service_key(), config.id());
        if let Some(mut consumers) = self.consumers.get_mut(path) {
            consumers.retain(|c| c.id() != config.id());
        }
        let drained = self
            .consumers
            .remove_if(path, |_, consumers| consumers.is_empty())
            .is_some()
            || !self.consumers.contains_key(path);
        if drained {
            self.snapshots.remove(path);
        }
        drained
    }

    /// 在线、协议/版本/分组一致，并合并覆盖规则
    pub fn matched_group(&self, path: &str, config: &ConsumerConfig) -> ProviderGroup {
        let snapshot = self
            .snapshots
            .get(path)
            .map(|s| s.value().clone())
            .unwrap_or_default();
        self.match_snapshot(path, config, &snapshot)
    }

    fn match_snapshot(
        &self,
        path: &str,
        config: &ConsumerConfig,
        snapshot: &[ChildData],
    ) -> ProviderGroup {
        let providers: Vec<ProviderInfo> = snapshot
            .iter()
            .filter(|child| helper::is_online(&child.data))
            .filter_map(|child| helper::parse_node(&child.name))
            .filter(|provider| config.matches(provider))
            .collect();
        let service_path = path.strip_suffix(PROVIDERS).unwrap_or(path).trim_end_matches('/');
        ProviderGroup::from_providers(self.overrides.apply(service_path, providers))
    }

    fn on_change(&self, path: &str, snapshot: &[ChildData]) {
        if !self.consumers.contains_key(path) {
            return;
        }
        self.snapshots.insert(path.to_string(), snapshot.to_vec());
        self.refresh(path);
    }

    /// 同一服务 key 的订阅者共享监听器，只推送一次
    pub fn refresh(&self, path: &str) {
        let Some(snapshot) = self.snapshots.get(path).map(|s| s.value().clone()) else {
            return;
        };
        let consumers = match self.consumers.get(path) {
            Some(consumers) => consumers.value().clone(),
            None => return,
        };

        let mut dispatched = HashSet::new();
        for consumer in &consumers {
            let key = consumer.service_key();
            if !dispatched.insert(key.clone()) {
                continue;
            }
            let group = self.match_snapshot(path, consumer, &snapshot);
            tracing::info!(
                service_key = %key,
                providers = group.len(),
                "Receive update of provider list"
            );
            self.dispatcher.notify(&key, &group);
        }
    }

    fn clear(&self) {
        self.consumers.clear();
        self.snapshots.clear();
    }
}

/// configs 子树：`key=value` 子节点组成的接口级配置
#[derive(Default)]
pub struct ConfigObserver {
    views: DashMap<String, BTreeMap<String, String>>,
    listeners: DashMap<String, Vec<ConfigListenerEntry>>,
}

fn config_view(snapshot: &[ChildData]) -> BTreeMap<String, String> {
    snapshot
        .iter()
        .filter_map(|child| helper::parse_config_entry(&child.name))
        .collect()
}

impl ConfigObserver {
    /// 新加入的监听器立即收到当前非空的配置
    pub fn add_listener(
        &self,
        path: &str,
        subscriber: Uuid,
        listener: Arc<dyn ConfigListener>,
        current: &[ChildData],
    ) {
        let view = self
            .views
            .entry(path.to_string())
            .or_insert_with(|| config_view(current))
            .clone();
        {
            let mut listeners = self.listeners.entry(path.to_string()).or_default();
            if listeners.iter().any(|(id, _)| *id == subscriber) {
                return;
            }
            listeners.push((subscriber, listener.clone()));
        }
        if !view.is_empty() {
            isolate(path, subscriber, || listener.config_changed(&view));
        }
    }

    pub fn remove_listener(&self, path: &str, subscriber: Uuid) {
        if let Some(mut listeners) = self.listeners.get_mut(path) {
            listeners.retain(|(id, _)| *id != subscriber);
        }
        self.listeners.remove_if(path, |_, listeners| listeners.is_empty());
    }

    /// 路径不再被监听时丢弃视图
    pub fn forget(&self, path: &str) {
        self.views.remove(path);
    }

    fn on_change(&self, path: &str, snapshot: &[ChildData]) {
        let view = config_view(snapshot);
        self.views.insert(path.to_string(), view.clone());
        let listeners = match self.listeners.get(path) {
            Some(listeners) => listeners.value().clone(),
            None => return,
        };
        for (subscriber, listener) in listeners {
            isolate(path, subscriber, || listener.config_changed(&view));
        }
    }

    fn clear(&self) {
        self.views.clear();
        self.listeners.clear();
    }
}

struct OverrideSubscriber {
    id: Uuid,
    address: String,
    listener: Option<Arc<dyn ConfigListener>>,
}

/// overrides 子树：IP 级覆盖规则
#[derive(Default)]
pub struct OverrideObserver {
    // 接口级路径 -> 规则
    rules: DashMap<String, Vec<ProviderInfo>>,
    subscribers: DashMap<String, Vec<OverrideSubscriber>>,
}

fn parse_rules(snapshot: &[ChildData]) -> Vec<ProviderInfo> {
    snapshot
        .iter()
        .filter_map(|child| helper::parse_node(&child.name))
        .collect()
}

impl OverrideObserver {
    /// 新订阅者立即收到命中本机地址的规则
    pub fn add_subscriber(&self, service_path: &str, config: &ConsumerConfig, current: &[ChildData]) {
        let rules = self
            .rules
            .entry(service_path.to_string())
            .or_insert_with(|| parse_rules(current))
            .clone();
        {
            let mut subscribers = self.subscribers.entry(service_path.to_string()).or_default();
            if subscribers.iter().any(|s| s.id == config.id()) {
                return;
            }
            subscribers.push(OverrideSubscriber {
                id: config.id(),
                address: config.address.clone(),
                listener: config.config_listener.clone(),
            });
        }
        if let Some(listener) = &config.config_listener {
            for rule in rules.iter().filter(|rule| rule.host == config.address) {
                isolate(service_path, config.id(), || listener.attr_updated(&rule.attributes));
            }
        }
    }

    /// 返回该接口是否已经没有订阅者
    pub fn remove_subscriber(&self, service_path: &str, subscriber: Uuid) -> bool {
        if let Some(mut subscribers) = self.subscribers.get_mut(service_path) {
            subscribers.retain(|s| s.id != subscriber);
        }
        self.subscribers
            .remove_if(service_path, |_, subscribers| subscribers.is_empty());
        let drained = !self.subscribers.contains_key(service_path);
        if drained {
            self.rules.remove(service_path);
        }
        drained
    }

    /// host 相同且（规则端口为 0 或端口相同）的端点合并规则属性
    pub fn apply(&self, service_path: &str, mut providers: Vec<ProviderInfo>) -> Vec<ProviderInfo> {
        let Some(rules) = self.rules.get(service_path) else {
            return providers;
        };
        for rule in rules.iter() {
            for provider in providers
                .iter_mut()
                .filter(|p| p.host == rule.host && (rule.port == 0 || rule.port == p.port))
            {
                provider
                    .attributes
                    .extend(rule.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        providers
    }

    fn on_change(&self, service_path: &str, event: &ChildEvent, snapshot: &[ChildData]) {
        if !self.subscribers.contains_key(service_path) {
            return;
        }
        self.rules.insert(service_path.to_string(), parse_rules(snapshot));

        let Some(rule) = helper::parse_node(&event.data.name) else {
            return;
        };
        let attributes = match event.kind {
            ChildEventKind::Removed => BTreeMap::new(),
            ChildEventKind::Added | ChildEventKind::Updated => rule.attributes.clone(),
        };
        let targets: Vec<(Uuid, Arc<dyn ConfigListener>)> = match self.subscribers.get(service_path) {
            Some(subscribers) => subscribers
                .iter()
                .filter(|s| s.address == rule.host)
                .filter_map(|s| s.listener.clone().map(|l| (s.id, l)))
                .collect(),
            None => return,
        };
        for (subscriber, listener) in targets {
            isolate(service_path, subscriber, || listener.attr_updated(&attributes));
        }
    }

    fn clear(&self) {
        self.rules.clear();
        self.subscribers.clear();
    }
}
