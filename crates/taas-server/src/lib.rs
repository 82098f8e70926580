//! Tap-as-a-Service control node
//!
//! Allocates a taas_id (VLAN tag) per tap service and drives the tap
//! service / tap flow lifecycle, emitting intents for the host agents.

pub mod allocator;
pub mod config;
pub mod orchestrator;
pub mod pool;

pub use allocator::VlanTagAllocator;
pub use config::{PoolConfig, ServerConfig};
pub use orchestrator::{IntentSink, TaasOrchestrator, TapFlowRequest};
pub use pool::InMemoryPoolStore;
