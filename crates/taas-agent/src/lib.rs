//! Tap-as-a-Service host agent
//!
//! taas-agent programs port mirroring on one compute host:
//! - Flow Controller: mirror rules on the Open vSwitch access and
//!   collection bridges, with cross-host tunnels
//! - SR-IOV Mirror Programmer: VF mirror settings through the NIC driver
//! - Intent dispatch by host and port attachment type

pub mod agent;
pub mod commands;
pub mod config;
pub mod flow_controller;
pub mod forward;
pub mod ovs;
pub mod sriov;
pub mod sysfs;
pub mod tables;

pub use agent::{Backend, Outcome, TaasAgent};
pub use config::{AgentConfig, DEFAULT_CONFIG_PATH};
pub use flow_controller::{tunnel_port_name, BridgeLayout, FlowController};
pub use forward::{CatchAllRedirect, ForwardAction, NormalForward};
pub use ovs::OvsSwitch;
pub use sriov::SriovProgrammer;
pub use sysfs::{SysfsNic, SysfsPci};
