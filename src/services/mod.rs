pub mod registry;
pub mod store;

pub use registry::{RegisterRequest, RegistryError, ServiceInstance, ServiceRegistry};
pub use store::{LeaseStore, MemoryStore, EtcdStore};
