use std::collections::HashMap;
use std::sync::Arc;

use super::error::RegistryError;
use super::types::{Registry, ShutdownFlag};
use crate::config::RegistryConfig;
use crate::services::coordination::{Connector, CoordinationRegistry, ZookeeperConnector};
use crate::services::event::EventBus;
use crate::services::local::LocalRegistry;

/// 构造注册中心时共享的协作者，默认连接真实的 ZooKeeper
#[derive(Clone)]
pub struct RegistryContext {
    pub event_bus: Option<EventBus>,
    pub shutdown: ShutdownFlag,
    pub connector: Arc<dyn Connector>,
}

impl Default for RegistryContext {
    fn default() -> Self {
        Self {
            event_bus: None,
            shutdown: ShutdownFlag::new(),
            connector: Arc::new(ZookeeperConnector),
        }
    }
}

impl std::fmt::Debug for RegistryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryContext")
            .field("event_bus", &self.event_bus.is_some())
            .field("shutdown", &self.shutdown.is_shutting_down())
            .finish_non_exhaustive()
    }
}

pub type RegistryConstructor =
    Arc<dyn Fn(RegistryConfig, RegistryContext) -> Arc<dyn Registry> + Send + Sync>;

/// 按名字选择注册中心实现
pub struct RegistryFactory {
    constructors: HashMap<String, RegistryConstructor>,
    context: RegistryContext,
}

impl RegistryFactory {
    /// 空工厂，不含任何实现
    pub fn empty(context: RegistryContext) -> Self {
        Self {
            constructors: HashMap::new(),
            context,
        }
    }

    /// 内置 local 与 zookeeper（别名 coordination）两种实现
    pub fn new(context: RegistryContext) -> Self {
        let mut factory = Self::empty(context);
        factory.add(
            "local",
            Arc::new(|config: RegistryConfig, context: RegistryContext| {
                Arc::new(LocalRegistry::new(config, context)) as Arc<dyn Registry>
            }),
        );
        let coordination: RegistryConstructor =
            Arc::new(|config: RegistryConfig, context: RegistryContext| {
                Arc::new(CoordinationRegistry::new(config, context)) as Arc<dyn Registry>
            });
        factory.add("zookeeper", coordination.clone());
        factory.add("coordination", coordination);
        factory
    }

    pub fn add(&mut self, name: impl Into<String>, constructor: RegistryConstructor) {
        self.constructors.insert(name.into().to_ascii_lowercase(), constructor);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn context(&self) -> &RegistryContext {
        &self.context
    }

    pub fn create(&self, config: RegistryConfig) -> Result<Arc<dyn Registry>, RegistryError> {
        let name = config.protocol.trim().to_ascii_lowercase();
        let constructor = self.constructors.get(&name).ok_or_else(|| {
            RegistryError::Configuration(format!("Unsupported registry protocol: {}", config.protocol))
        })?;

        tracing::info!(protocol = %name, "Creating registry");
        Ok(constructor(config, self.context.clone()))
    }
}

impl Default for RegistryFactory {
    fn default() -> Self {
        Self::new(RegistryContext::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_protocol_is_configuration_error() {
        let factory = RegistryFactory::default();
        let config = RegistryConfig {
            protocol: "consul".to_string(),
            ..RegistryConfig::default()
        };
        assert!(matches!(factory.create(config), Err(RegistryError::Configuration(_))));
    }

    #[test]
    fn test_builtin_names() {
        let factory = RegistryFactory::default();
        assert_eq!(factory.names(), vec!["coordination", "local", "zookeeper"]);
        let registry = factory.create(RegistryConfig::local("/tmp/unused.toml")).unwrap();
        assert_eq!(registry.config().protocol, "local");
    }
}
