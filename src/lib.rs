pub mod config;
pub mod services;

pub use config::RegistryConfig;
pub use services::model::{
    ConfigListener, ConsumerConfig, ProviderConfig, ProviderGroup, ProviderInfo,
    ProviderInfoListener, ServerConfig, ServiceKey,
};
pub use services::registry::{Registry, RegistryContext, RegistryError, RegistryFactory};
