pub mod coordination;
pub mod event;
pub mod local;
pub mod model;
pub mod registry;

pub use coordination::CoordinationRegistry;
pub use local::LocalRegistry;
pub use registry::{Registry, RegistryError, RegistryFactory};
