pub mod adaptor;
pub mod controller;
pub mod endpoint_discovery;
pub mod informer;
pub mod nat;
pub mod reconcile;
pub mod relay;
pub mod security_group;
pub mod stun;

pub use fabric_shared::{AgentError, Device, DeviceCacheEntry, Endpoint, WgLocalConfig, WgPeerConfig};
