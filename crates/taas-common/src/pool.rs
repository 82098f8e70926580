//! Pool-store collaborator interface for taas_id assignment.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::TaasResult;

/// Persisted record of which taas_id belongs to which tap service.
///
/// Implementations must make `try_assign` atomic: of two concurrent calls
/// for the same taas_id at most one returns `true`.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Every taas_id currently assigned.
    async fn list_assigned(&self) -> TaasResult<BTreeSet<u16>>;

    /// Assigns `taas_id` to `tap_service_id`. Returns `false` if the id is
    /// already taken.
    async fn try_assign(&self, taas_id: u16, tap_service_id: &str) -> TaasResult<bool>;

    /// Removes the assignment of `tap_service_id`, returning the freed id.
    async fn unassign(&self, tap_service_id: &str) -> TaasResult<Option<u16>>;

    /// The taas_id assigned to `tap_service_id`, if any.
    async fn lookup(&self, tap_service_id: &str) -> TaasResult<Option<u16>>;
}
