//! Test infrastructure for the Tap-as-a-Service control plane
//!
//! Provides:
//! - An in-memory switch with Open vSwitch flow-table semantics
//! - Fake SR-IOV NIC and PCI lookup collaborators
//! - Tap service / tap flow intent fixtures
//! - Rule-set diffing and command verification helpers

pub mod fake_nic;
pub mod fake_switch;
pub mod fixtures;
mod verification;

pub use fake_nic::{FakeNic, FakePci};
pub use fake_switch::{FakePort, FakePortKind, FakeSwitch, FlowSnapshot};
pub use fixtures::*;
pub use verification::*;
