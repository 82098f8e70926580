//! Shared infrastructure for the Tap-as-a-Service mirroring control plane.
//!
//! This crate provides:
//! - [`vlan_range`]: VLAN range string codec
//! - [`affiliation`]: refcounted key → value-set index for shared resources
//! - [`TaasError`]: common error type
//! - [`shell`]: shell command execution with quoting
//! - Data model and intent messages exchanged with host agents
//! - Collaborator traits: [`SwitchControl`], [`NicControl`], [`PciLookup`],
//!   [`PoolStore`]

pub mod affiliation;
pub mod error;
pub mod flow;
pub mod intent;
pub mod model;
pub mod nic;
pub mod pool;
pub mod shell;
pub mod switch;
pub mod vlan_range;

pub use affiliation::Affiliations;
pub use error::{TaasError, TaasResult};
pub use flow::{FlowMatch, FlowRule};
pub use intent::{FlowIntent, Intent, ServiceIntent};
pub use model::{
    Direction, HostEndpoint, PortBinding, PortInfo, Status, TapFlow, TapService, VnicType,
};
pub use nic::{MirrorCommand, MirrorOp, MirrorTarget, NicControl, PciLookup, VfDirection};
pub use pool::PoolStore;
pub use switch::{PortSpec, SwitchControl, TunnelSpec, TunnelType, VifPort};
pub use vlan_range::VlanSet;
