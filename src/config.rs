use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::services::registry::RegistryError;

/// 本地注册中心扫描周期参数（毫秒）
pub const PARAM_LOCAL_SCAN_PERIOD: &str = "registry.local.scan.period";
/// 最后一个订阅者退订后是否清理空的服务分组
pub const PARAM_LOCAL_PRUNE_EMPTY: &str = "registry.local.prune.empty";
/// 优先使用本地文件
pub const PARAM_PREFER_LOCAL_FILE: &str = "preferLocalFile";
/// 是否创建临时节点
pub const PARAM_CREATE_EPHEMERAL: &str = "createEphemeral";
/// ACL 鉴权方案
pub const PARAM_AUTH_SCHEME: &str = "scheme";
/// ACL 鉴权信息，格式 user1:passwd1,user2:passwd2
pub const PARAM_ADD_AUTH: &str = "addAuth";

pub const DEFAULT_SCAN_PERIOD_MS: u64 = 2000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

// 注册中心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 注册中心类型，例如 local / zookeeper
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// 协调服务地址 host:port[,host:port][/rootPath]
    #[serde(default)]
    pub address: Option<String>,
    /// 本地注册中心备份文件
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// 是否发布服务
    #[serde(default = "default_true")]
    pub register: bool,
    /// 是否订阅服务
    #[serde(default = "default_true")]
    pub subscribe: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 各实现自定义的参数
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

fn default_protocol() -> String {
    "local".to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            address: None,
            file: None,
            register: true,
            subscribe: true,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            parameters: HashMap::new(),
        }
    }
}

impl RegistryConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .map_err(|e| RegistryError::ConfigLoad(format!("{}: {e}", path.display())))?;
        let config: RegistryConfig =
            toml::from_str(&config_str).map_err(|e| RegistryError::ConfigLoad(e.to_string()))?;
        Ok(config)
    }

    /// 从 REGISTRY_* 环境变量读取配置
    pub fn from_env() -> Result<Self, RegistryError> {
        envy::prefixed("REGISTRY_")
            .from_env::<RegistryConfig>()
            .map_err(|e| RegistryError::ConfigLoad(e.to_string()))
    }

    pub fn local(file: impl Into<PathBuf>) -> Self {
        Self {
            protocol: "local".to_string(),
            file: Some(file.into()),
            ..Self::default()
        }
    }

    pub fn zookeeper(address: impl Into<String>) -> Self {
        Self {
            protocol: "zookeeper".to_string(),
            address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// 只有显式配置为 false 时才返回 false
    pub fn bool_parameter(&self, key: &str, default: bool) -> bool {
        match self.parameter(key).map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("false") => false,
            Some(value) if value.eq_ignore_ascii_case("true") => true,
            _ => default,
        }
    }

    pub fn scan_period(&self) -> Duration {
        let millis = self
            .parameter(PARAM_LOCAL_SCAN_PERIOD)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_SCAN_PERIOD_MS);
        Duration::from_millis(millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        self.connect_timeout() * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.toml");
        fs::write(
            &path,
            r#"
protocol = "zookeeper"
address = "127.0.0.1:2181/rpc"
connect_timeout_ms = 1000

[parameters]
createEphemeral = "false"
"#,
        )
        .unwrap();

        let config = RegistryConfig::load(&path).unwrap();
        assert_eq!(config.protocol, "zookeeper");
        assert_eq!(config.address.as_deref(), Some("127.0.0.1:2181/rpc"));
        assert!(config.register);
        assert!(config.subscribe);
        assert!(!config.bool_parameter(PARAM_CREATE_EPHEMERAL, true));
        assert_eq!(config.session_timeout(), Duration::from_millis(3000));
    }

    #[test]
    fn test_scan_period_falls_back_to_default() {
        let config = RegistryConfig::local("/tmp/registry.toml");
        assert_eq!(config.scan_period(), Duration::from_millis(DEFAULT_SCAN_PERIOD_MS));

        let config = config.with_parameter(PARAM_LOCAL_SCAN_PERIOD, "abc");
        assert_eq!(config.scan_period(), Duration::from_millis(DEFAULT_SCAN_PERIOD_MS));

        let config = config.with_parameter(PARAM_LOCAL_SCAN_PERIOD, "150");
        assert_eq!(config.scan_period(), Duration::from_millis(150));
    }

    #[test]
    fn test_bool_parameter_only_false_disables() {
        let config = RegistryConfig::default().with_parameter(PARAM_PREFER_LOCAL_FILE, "no");
        assert!(config.bool_parameter(PARAM_PREFER_LOCAL_FILE, true));
        let config = config.with_parameter(PARAM_PREFER_LOCAL_FILE, "FALSE");
        assert!(!config.bool_parameter(PARAM_PREFER_LOCAL_FILE, true));
    }
}
