use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::services::model::ServiceKey;

/// 事件总线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 每个事件类型的最大订阅者数量
    pub max_subscribers_per_type: usize,
    /// 广播通道容量
    pub channel_capacity: usize,
    /// 是否启用事件统计
    pub enable_metrics: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            max_subscribers_per_type: 1000,
            channel_capacity: 1024,
            enable_metrics: true,
        }
    }
}

/// 注册中心生命周期事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// 服务发布成功
    ProviderPublished,
    /// 服务订阅成功
    ConsumerSubscribed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ProviderPublished => "provider.pub",
            EventKind::ConsumerSubscribed => "consumer.sub",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 注册中心生命周期事件
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub service_key: ServiceKey,
    pub app_name: String,
    /// 发布的端点 url 或订阅者自身 url
    pub urls: Vec<String>,
    pub timestamp: i64,
}

impl RegistryEvent {
    pub fn new(kind: EventKind, service_key: ServiceKey, app_name: impl Into<String>) -> Self {
        Self {
            event_id: String::new(),
            kind,
            service_key,
            app_name: app_name.into(),
            urls: Vec::new(),
            timestamp: 0,
        }
    }

    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }
}

/// 事件总线错误类型
#[derive(Error, Debug)]
pub enum EventError {
    #[error("No subscribers for event type: {event_type}")]
    NoSubscribers { event_type: String },

    #[error("Subscriber limit exceeded for event type: {event_type}")]
    SubscriberLimitExceeded { event_type: String },

    #[error("Event bus disabled")]
    Disabled,
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 活跃的事件类型数量
    pub active_event_types: usize,
    /// 总订阅者数量
    pub total_subscribers: usize,
    /// 已发布的事件总数
    pub events_published: u64,
    /// 已投递的事件总数
    pub events_delivered: u64,
}

/// 订阅者信息
#[derive(Debug, Clone)]
pub struct SubscriberInfo {
    pub subscriber_id: String,
    pub event_kinds: Vec<EventKind>,
    pub subscribed_at: std::time::SystemTime,
}
