//! Coordination-service registry backend
//!
//! - `client`: the minimal hierarchical-namespace client contract and its error type
//! - `zookeeper`: client over a real ZooKeeper ensemble, the default connector
//! - `memory`: in-process ensemble used for embedding and tests
//! - `helper`: address parsing, node paths and URL escaping
//! - `mirror`: per-path child caches shared by reference count
//! - `observer`: provider / config / override subtree observers
//! - `registry`: the `Registry` implementation with reconnect replay

pub mod client;
pub mod helper;
pub mod memory;
pub mod mirror;
pub mod observer;
pub mod registry;
pub mod zookeeper;

pub use client::{
    AuthInfo, ChildData, ChildEvent, ChildEventKind, ClientSettings, ConnectionState, Connector,
    CoordinationClient, CoordinationError, CreateMode,
};
pub use memory::{MemoryClient, MemoryConnector, MemoryEnsemble};
pub use registry::CoordinationRegistry;
pub use zookeeper::{ZookeeperClient, ZookeeperConnector};
