use std::collections::BTreeMap;

use super::provider::ProviderGroup;

/// 监听器回调失败
#[derive(Debug, thiserror::Error)]
#[error("Listener failed: {0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// 服务端列表监听器，每次检测到变化时被调用
pub trait ProviderInfoListener: Send + Sync {
    fn update_providers(&self, group: &ProviderGroup) -> Result<(), ListenerError>;
}

/// 配置监听器
pub trait ConfigListener: Send + Sync {
    /// 接口级配置（configs 子树）变化，参数为完整的 key/value 视图
    fn config_changed(&self, configs: &BTreeMap<String, String>) -> Result<(), ListenerError>;

    /// 命中本机地址的 IP 级覆盖配置变化，移除时传入空 map
    fn attr_updated(&self, attributes: &BTreeMap<String, String>) -> Result<(), ListenerError>;
}
