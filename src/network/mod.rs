pub mod fabric;
pub mod pool;
pub mod proxy;

pub use fabric::{FabricConfig, NetworkError, NetworkFabric};
pub use pool::{PoolError, ProxyPool};
pub use proxy::{ProxyDescriptor, ProxyProtocol, ProxyUrlError};
