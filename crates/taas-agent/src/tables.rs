//! Flow table layout of the access and collection bridges.

/// Access bridge table holding the mirror rules.
pub const ACCESS_TABLE: u8 = 0;

/// Collection bridge: classifies where mirrored traffic came from.
pub const COLLECTION_CLASSIFY_TABLE: u8 = 0;

/// Collection bridge: delivers mirrored traffic by taas_id.
pub const COLLECTION_DELIVER_TABLE: u8 = 1;

/// Rule priorities.
pub mod priority {
    /// Default drop rules on the collection bridge.
    pub const DROP: u16 = 0;
    /// Local patch traffic into the delivery table.
    pub const FROM_PATCH: u16 = 1;
    /// Mirrored traffic arriving over a tunnel.
    pub const TUNNEL_RECEIVE: u16 = 10;
    /// Per-port mirror rules on the access bridge; taas_id → tunnel on the
    /// collection bridge.
    pub const MIRROR: u16 = 20;
    /// taas_id → collection port.
    pub const SERVICE: u16 = 25;
}

/// Port `other_config` key holding a collection port's access VLAN tag
/// while it is owned by the collection bridge.
pub const ORIGINAL_TAG_KEY: &str = "taas-original-tag";

/// Prefix of tunnel port names created by the agent.
pub const TUNNEL_PORT_PREFIX: &str = "t";
