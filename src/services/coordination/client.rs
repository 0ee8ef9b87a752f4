use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

/// 协调服务客户端错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    #[error("Node already exists: {0}")]
    NodeExists(String),
    #[error("Node does not exist: {0}")]
    NoNode(String),
    #[error("Node has children: {0}")]
    NotEmpty(String),
    #[error("Client not started")]
    NotStarted,
    #[error("Client closed")]
    Closed,
    #[error("Connection lost")]
    ConnectionLoss,
    #[error("Session expired")]
    SessionExpired,
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Operation timed out")]
    Timeout,
    #[error("Coordination service error: {0}")]
    Remote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// 随会话结束自动删除
    Ephemeral,
}

/// 某个子节点的路径、名字和数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildData {
    pub path: String,
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEventKind {
    Added,
    Removed,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEvent {
    pub kind: ChildEventKind,
    pub data: ChildData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Suspended,
    Lost,
    /// 会话恢复（或新会话建立）后触发，需要重放本地数据
    Reconnected,
}

/// ACL 鉴权信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub scheme: String,
    pub auth: Vec<u8>,
}

impl AuthInfo {
    pub fn new(scheme: impl Into<String>, auth: impl Into<Vec<u8>>) -> Self {
        Self {
            scheme: scheme.into(),
            auth: auth.into(),
        }
    }
}

/// 建立连接所需的参数
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// host:port[,host:port]，不含根路径
    pub connect_string: String,
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
    pub auth: Vec<AuthInfo>,
}

/// 层次化协调服务的最小客户端接口
#[async_trait]
pub trait CoordinationClient: Send + Sync + fmt::Debug {
    async fn start(&self) -> Result<(), CoordinationError>;

    fn is_started(&self) -> bool;

    async fn close(&self);

    /// 自动创建缺失的父节点（持久节点）
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<(), CoordinationError>;

    async fn delete(&self, path: &str) -> Result<(), CoordinationError>;

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError>;

    /// 直接子节点，按名字排序
    async fn children(&self, path: &str) -> Result<Vec<ChildData>, CoordinationError>;

    /// 订阅直接子节点的增删改，丢弃接收端即取消订阅
    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChildEvent>, CoordinationError>;

    fn connection_states(&self) -> broadcast::Receiver<ConnectionState>;
}

/// 按连接参数创建客户端
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn CoordinationClient>, CoordinationError>;
}
