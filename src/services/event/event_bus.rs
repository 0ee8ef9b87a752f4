use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use super::types::{EventConfig, EventError, EventKind, EventStats, RegistryEvent, SubscriberInfo};

/// 基于 Tokio broadcast 的注册中心事件总线
///
/// 注册中心只在总线启用且该类型有订阅者时投递事件，且从不等待或检查投递结果。
#[derive(Debug, Clone)]
pub struct EventBus {
    /// 事件类型 -> broadcast 发送器的映射
    channels: Arc<DashMap<EventKind, broadcast::Sender<RegistryEvent>>>,
    /// 订阅者信息 (订阅者ID -> 订阅信息)
    subscribers: Arc<DashMap<String, SubscriberInfo>>,
    /// 事件统计
    stats: Arc<Mutex<EventStats>>,
    enabled: Arc<AtomicBool>,
    config: EventConfig,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventConfig::default())
    }
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new(config: EventConfig) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            stats: Arc::new(Mutex::new(EventStats::default())),
            enabled: Arc::new(AtomicBool::new(true)),
            config,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// 总线启用并且该类型至少有一个活跃订阅者
    pub fn is_enabled(&self, kind: EventKind) -> bool {
        self.enabled.load(Ordering::SeqCst)
            && self
                .channels
                .get(&kind)
                .map(|sender| sender.receiver_count() > 0)
                .unwrap_or(false)
    }

    /// 发布事件到该类型的所有订阅者，返回投递数量
    pub fn publish_event(&self, mut event: RegistryEvent) -> Result<usize, EventError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(EventError::Disabled);
        }

        // 如果事件ID为空，生成一个新的
        if event.event_id.is_empty() {
            event.event_id = Uuid::new_v4().to_string();
        }

        // 如果时间戳为0，设置当前时间
        if event.timestamp == 0 {
            event.timestamp = SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
        }

        let kind = event.kind;
        let event_id = event.event_id.clone();
        let sender = self.get_or_create_channel(kind);

        match sender.send(event) {
            Ok(subscriber_count) => {
                if self.config.enable_metrics {
                    let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
                    stats.events_published += 1;
                    stats.events_delivered += subscriber_count as u64;
                }

                tracing::debug!(
                    event_type = %kind,
                    event_id = %event_id,
                    subscriber_count = %subscriber_count,
                    "Published event successfully"
                );

                Ok(subscriber_count)
            }
            Err(_) => {
                tracing::debug!(
                    event_type = %kind,
                    event_id = %event_id,
                    "No active subscribers for event"
                );

                Err(EventError::NoSubscribers {
                    event_type: kind.to_string(),
                })
            }
        }
    }

    /// 注册中心使用的投递入口：未启用时直接跳过，结果忽略
    pub fn post(&self, event: RegistryEvent) {
        if self.is_enabled(event.kind) {
            let _ = self.publish_event(event);
        }
    }

    /// 订阅指定事件类型，返回事件流
    pub fn subscribe_event_type(
        &self,
        kind: EventKind,
        subscriber_id: &str,
    ) -> Result<BroadcastStream<RegistryEvent>, EventError> {
        // 检查订阅者限制
        if self.get_subscriber_count_for_kind(kind) >= self.config.max_subscribers_per_type {
            return Err(EventError::SubscriberLimitExceeded {
                event_type: kind.to_string(),
            });
        }

        let receiver = self.get_or_create_channel(kind).subscribe();
        self.update_subscriber_info(subscriber_id, kind);

        tracing::info!(
            event_type = %kind,
            subscriber_id = %subscriber_id,
            "New subscription created"
        );

        Ok(BroadcastStream::new(receiver))
    }

    /// 移除订阅者的所有订阅
    pub fn remove_subscriber(&self, subscriber_id: &str) {
        if let Some((_, subscriber_info)) = self.subscribers.remove(subscriber_id) {
            tracing::info!(
                subscriber_id = %subscriber_id,
                unsubscribed_events = %subscriber_info.event_kinds.len(),
                "Removed all subscriptions for subscriber"
            );
        }
    }

    /// 获取事件统计信息
    pub fn get_stats(&self) -> EventStats {
        let base_stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        EventStats {
            active_event_types: self.channels.len(),
            total_subscribers: self.subscribers.len(),
            ..base_stats
        }
    }

    pub fn get_subscribers(&self) -> Vec<SubscriberInfo> {
        self.subscribers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn get_subscriber_count_for_kind(&self, kind: EventKind) -> usize {
        self.subscribers
            .iter()
            .filter(|entry| entry.value().event_kinds.contains(&kind))
            .count()
    }

    /// 获取或创建事件类型的广播通道
    fn get_or_create_channel(&self, kind: EventKind) -> broadcast::Sender<RegistryEvent> {
        self.channels
            .entry(kind)
            .or_insert_with(|| {
                tracing::debug!(
                    event_type = %kind,
                    capacity = %self.config.channel_capacity,
                    "Created new broadcast channel for event type"
                );
                broadcast::channel(self.config.channel_capacity).0
            })
            .clone()
    }

    fn update_subscriber_info(&self, subscriber_id: &str, kind: EventKind) {
        self.subscribers
            .entry(subscriber_id.to_string())
            .and_modify(|info| {
                if !info.event_kinds.contains(&kind) {
                    info.event_kinds.push(kind);
                }
            })
            .or_insert_with(|| SubscriberInfo {
                subscriber_id: subscriber_id.to_string(),
                event_kinds: vec![kind],
                subscribed_at: SystemTime::now(),
            });
    }
}
