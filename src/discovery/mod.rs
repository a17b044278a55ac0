pub mod service_discovery;

pub use service_discovery::{RoundRobin, ServiceDiscovery, ServiceEntry, StaticDiscovery};
