//! Registry data model
//!
//! - `provider`: endpoint (`ProviderInfo`) and endpoint set (`ProviderGroup`)
//! - `service_key`: the registration/subscription/notification unit
//! - `interface_config`: provider and consumer side configuration
//! - `listener`: callbacks the registry pushes updates into
//! - `diff`: backend-agnostic mapping difference

pub mod diff;
pub mod interface_config;
pub mod listener;
pub mod provider;
pub mod service_key;

pub use diff::{MappingDiff, ProviderMapping};
pub use interface_config::{ConsumerConfig, ProviderConfig, ServerConfig};
pub use listener::{ConfigListener, ListenerError, ProviderInfoListener};
pub use provider::{ParseProviderError, ProviderGroup, ProviderInfo};
pub use service_key::ServiceKey;
