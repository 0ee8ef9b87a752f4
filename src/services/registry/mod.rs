//! Registry contract module
//!
//! - `types`: the `Registry` trait, lifecycle state and shutdown flag
//! - `error`: error taxonomy shared by all backends
//! - `dispatcher`: provider group fan-out to subscribed listeners
//! - `factory`: name-driven backend selection

pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod types;

pub use dispatcher::NotificationDispatcher;
pub use error::RegistryError;
pub use factory::{RegistryConstructor, RegistryContext, RegistryFactory};
pub use types::{DestroyHook, Lifecycle, Registry, RegistryState, ShutdownFlag};
