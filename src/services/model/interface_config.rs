use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::listener::{ConfigListener, ProviderInfoListener};
use super::provider::{
    ATTR_APP_NAME, ATTR_DYNAMIC, ATTR_GROUP, ATTR_SERIALIZATION, ATTR_VERSION, ATTR_WEIGHT,
    ProviderInfo,
};
use super::service_key::ServiceKey;

pub const DEFAULT_VERSION: &str = "1.0";
pub const DEFAULT_PROTOCOL: &str = "bolt";
pub const DEFAULT_SERIALIZATION: &str = "hessian2";
pub const DEFAULT_WEIGHT: u32 = 100;

// 服务端监听配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
        }
    }
}

/// 服务发布配置
///
/// `id` 是配置身份，克隆出来的副本共享同一个 id，注册中心的旁路表与监听器都按它索引。
#[derive(Clone)]
pub struct ProviderConfig {
    id: Uuid,
    pub interface: String,
    pub version: String,
    pub group: String,
    pub app_name: String,
    pub servers: Vec<ServerConfig>,
    pub weight: u32,
    pub serialization: String,
    /// 是否发布到注册中心
    pub register: bool,
    /// 是否订阅接口级配置
    pub subscribe: bool,
    /// false 时以下线状态发布，需要运维手动上线
    pub dynamic: bool,
    pub parameters: BTreeMap<String, String>,
    pub config_listener: Option<Arc<dyn ConfigListener>>,
}

impl ProviderConfig {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            interface: interface.into(),
            version: DEFAULT_VERSION.to_string(),
            group: String::new(),
            app_name: String::new(),
            servers: Vec::new(),
            weight: DEFAULT_WEIGHT,
            serialization: DEFAULT_SERIALIZATION.to_string(),
            register: true,
            subscribe: true,
            dynamic: true,
            parameters: BTreeMap::new(),
            config_listener: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.servers.push(server);
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_register(mut self, register: bool) -> Self {
        self.register = register;
        self
    }

    pub fn with_subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = subscribe;
        self
    }

    pub fn with_dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_config_listener(mut self, listener: Arc<dyn ConfigListener>) -> Self {
        self.config_listener = Some(listener);
        self
    }

    pub fn service_key(&self, protocol: &str) -> ServiceKey {
        ServiceKey::new(&self.interface, &self.version, &self.group, protocol)
    }

    /// 某个服务端对应的端点信息
    pub fn provider_info(&self, server: &ServerConfig) -> ProviderInfo {
        let mut provider = ProviderInfo::new(&server.protocol, &server.host, server.port)
            .with_attribute(ATTR_VERSION, &self.version)
            .with_attribute(ATTR_WEIGHT, self.weight.to_string())
            .with_attribute(ATTR_SERIALIZATION, &self.serialization);
        if !self.group.is_empty() {
            provider = provider.with_attribute(ATTR_GROUP, &self.group);
        }
        if !self.app_name.is_empty() {
            provider = provider.with_attribute(ATTR_APP_NAME, &self.app_name);
        }
        if !self.dynamic {
            provider = provider.with_attribute(ATTR_DYNAMIC, "false");
        }
        for (key, value) in &self.parameters {
            provider.attributes.entry(key.clone()).or_insert_with(|| value.clone());
        }
        provider
    }

    /// 每个服务端一组 (服务 key, 端点)
    pub fn provider_infos(&self) -> Vec<(ServiceKey, ProviderInfo)> {
        self.servers
            .iter()
            .map(|server| (self.service_key(&server.protocol), self.provider_info(server)))
            .collect()
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("interface", &self.interface)
            .field("version", &self.version)
            .field("group", &self.group)
            .field("servers", &self.servers)
            .field("register", &self.register)
            .field("subscribe", &self.subscribe)
            .field("dynamic", &self.dynamic)
            .finish_non_exhaustive()
    }
}

/// 服务引用配置
#[derive(Clone)]
pub struct ConsumerConfig {
    id: Uuid,
    pub interface: String,
    pub version: String,
    pub group: String,
    pub protocol: String,
    pub app_name: String,
    /// 本机地址，用于发布消费者节点和匹配 IP 级覆盖配置
    pub address: String,
    pub register: bool,
    pub subscribe: bool,
    pub parameters: BTreeMap<String, String>,
    pub provider_listener: Option<Arc<dyn ProviderInfoListener>>,
    pub config_listener: Option<Arc<dyn ConfigListener>>,
}

impl ConsumerConfig {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            interface: interface.into(),
            version: DEFAULT_VERSION.to_string(),
            group: String::new(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            app_name: String::new(),
            address: "127.0.0.1".to_string(),
            register: true,
            subscribe: true,
            parameters: BTreeMap::new(),
            provider_listener: None,
            config_listener: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_register(mut self, register: bool) -> Self {
        self.register = register;
        self
    }

    pub fn with_subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = subscribe;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_provider_listener(mut self, listener: Arc<dyn ProviderInfoListener>) -> Self {
        self.provider_listener = Some(listener);
        self
    }

    pub fn with_config_listener(mut self, listener: Arc<dyn ConfigListener>) -> Self {
        self.config_listener = Some(listener);
        self
    }

    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(&self.interface, &self.version, &self.group, &self.protocol)
    }

    /// 消费者自身的端点，发布到 consumers 子树
    pub fn consumer_info(&self) -> ProviderInfo {
        let mut info = ProviderInfo::new(&self.protocol, &self.address, 0)
            .with_attribute(ATTR_VERSION, &self.version)
            .with_attribute("pid", std::process::id().to_string());
        if !self.group.is_empty() {
            info = info.with_attribute(ATTR_GROUP, &self.group);
        }
        if !self.app_name.is_empty() {
            info = info.with_attribute(ATTR_APP_NAME, &self.app_name);
        }
        info
    }

    /// 端点是否属于本次订阅（协议、版本、分组都一致）
    pub fn matches(&self, provider: &ProviderInfo) -> bool {
        if !self.protocol.is_empty() && provider.protocol != self.protocol {
            return false;
        }
        let version = provider.attribute(ATTR_VERSION).unwrap_or(DEFAULT_VERSION);
        let group = provider.attribute(ATTR_GROUP).unwrap_or_default();
        version == self.version && group == self.group
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("id", &self.id)
            .field("interface", &self.interface)
            .field("version", &self.version)
            .field("group", &self.group)
            .field("protocol", &self.protocol)
            .field("address", &self.address)
            .field("register", &self.register)
            .field("subscribe", &self.subscribe)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_infos_per_server() {
        let config = ProviderConfig::new("Echo")
            .with_server(ServerConfig::new("bolt", "10.0.0.1", 22000))
            .with_server(ServerConfig::new("h2c", "10.0.0.1", 12200));
        let infos = config.provider_infos();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].0.as_str(), "Echo:1.0@bolt");
        assert_eq!(infos[1].0.as_str(), "Echo:1.0@h2c");
        assert_eq!(infos[0].1.attribute(ATTR_WEIGHT), Some("100"));
    }

    #[test]
    fn test_consumer_matching() {
        let consumer = ConsumerConfig::new("Echo").with_group("blue");
        let provider = ProviderConfig::new("Echo")
            .with_group("blue")
            .provider_info(&ServerConfig::new("bolt", "10.0.0.1", 22000));
        assert!(consumer.matches(&provider));

        let other_group = ProviderConfig::new("Echo")
            .provider_info(&ServerConfig::new("bolt", "10.0.0.1", 22000));
        assert!(!consumer.matches(&other_group));

        let other_protocol = ProviderConfig::new("Echo")
            .with_group("blue")
            .provider_info(&ServerConfig::new("h2c", "10.0.0.1", 22000));
        assert!(!consumer.matches(&other_protocol));
    }

    #[test]
    fn test_clones_share_identity() {
        let config = ConsumerConfig::new("Echo");
        assert_eq!(config.clone().id(), config.id());
        assert_ne!(ConsumerConfig::new("Echo").id(), config.id());
    }
}
