//! VLAN Tag Allocator.
//!
//! Hands out taas_ids from `[start, end)`, one per tap service. The
//! assignment of record lives in a [`PoolStore`]; the allocator keeps a
//! cached free set so allocations do not read the whole store each time.
//! The cache can go stale when other allocators share the store:
//!
//! - an empty cache is rebuilt from the store at most once per allocation
//!   before `PoolExhausted` is reported;
//! - a store conflict drops the cache and retries with a fresh read, up to
//!   `max_attempts` times.

use std::collections::BTreeSet;
use std::sync::Arc;

use taas_common::pool::PoolStore;
use taas_common::{TaasError, TaasResult};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;

pub struct VlanTagAllocator<S: PoolStore> {
    store: Arc<S>,
    start: u16,
    end: u16,
    max_attempts: u32,
    free: Mutex<Option<BTreeSet<u16>>>,
}

impl<S: PoolStore> VlanTagAllocator<S> {
    pub fn new(store: Arc<S>, config: &PoolConfig) -> Self {
        Self {
            store,
            start: config.vlan_range_start,
            end: config.vlan_range_end,
            max_attempts: config.max_allocation_attempts.max(1),
            free: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Number of taas_ids in the pool.
    pub fn capacity(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start))
    }

    async fn rebuild(&self) -> TaasResult<BTreeSet<u16>> {
        let assigned = self.store.list_assigned().await?;
        let free: BTreeSet<u16> = (self.start..self.end)
            .filter(|id| !assigned.contains(id))
            .collect();
        debug!(
            free = free.len(),
            assigned = assigned.len(),
            "Rebuilt taas_id free set"
        );
        Ok(free)
    }

    /// Assigns a free taas_id to `tap_service_id`.
    ///
    /// A service that already holds a taas_id gets it back.
    pub async fn allocate(&self, tap_service_id: &str) -> TaasResult<u16> {
        let mut free = self.free.lock().await;

        if let Some(taas_id) = self.store.lookup(tap_service_id).await? {
            debug!(tap_service = tap_service_id, taas_id, "taas_id already assigned");
            return Ok(taas_id);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut rebuilt = false;
            if free.is_none() {
                *free = Some(self.rebuild().await?);
                rebuilt = true;
            }
            let mut candidate = free.as_mut().and_then(|f| f.pop_first());
            if candidate.is_none() && !rebuilt {
                let mut fresh = self.rebuild().await?;
                candidate = fresh.pop_first();
                *free = Some(fresh);
            }
            let Some(taas_id) = candidate else {
                warn!(start = self.start, end = self.end, "taas_id pool exhausted");
                return Err(TaasError::PoolExhausted {
                    start: self.start,
                    end: self.end,
                });
            };

            if self.store.try_assign(taas_id, tap_service_id).await? {
                info!(tap_service = tap_service_id, taas_id, "taas_id allocated");
                return Ok(taas_id);
            }

            warn!(
                tap_service = tap_service_id,
                taas_id,
                attempt,
                "taas_id taken by a concurrent allocation"
            );
            *free = None;
            if attempt >= self.max_attempts {
                return Err(TaasError::AllocationConflict { taas_id });
            }
        }
    }

    /// Frees the taas_id of `tap_service_id`. No-op if it holds none.
    pub async fn release(&self, tap_service_id: &str) -> TaasResult<Option<u16>> {
        let mut free = self.free.lock().await;
        let released = self.store.unassign(tap_service_id).await?;
        match released {
            Some(taas_id) => {
                if let Some(free) = free.as_mut() {
                    if (self.start..self.end).contains(&taas_id) {
                        free.insert(taas_id);
                    }
                }
                info!(tap_service = tap_service_id, taas_id, "taas_id released");
            }
            None => debug!(tap_service = tap_service_id, "No taas_id to release"),
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::InMemoryPoolStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn pool(start: u16, end: u16) -> PoolConfig {
        PoolConfig {
            vlan_range_start: start,
            vlan_range_end: end,
            max_allocation_attempts: 3,
        }
    }

    /// Store that loses the next `races` assignments to another allocator.
    struct RacingStore {
        inner: InMemoryPoolStore,
        races: AtomicU32,
    }

    impl RacingStore {
        fn new(races: u32) -> Self {
            Self {
                inner: InMemoryPoolStore::new(),
                races: AtomicU32::new(races),
            }
        }
    }

    #[async_trait]
    impl PoolStore for RacingStore {
        async fn list_assigned(&self) -> TaasResult<BTreeSet<u16>> {
            self.inner.list_assigned().await
        }

        async fn try_assign(&self, taas_id: u16, tap_service_id: &str) -> TaasResult<bool> {
            let remaining = self.races.load(Ordering::SeqCst);
            if remaining > 0 {
                self.races.store(remaining - 1, Ordering::SeqCst);
                let rival = format!("rival-{}", remaining);
                self.inner.try_assign(taas_id, &rival).await?;
                return Ok(false);
            }
            self.inner.try_assign(taas_id, tap_service_id).await
        }

        async fn unassign(&self, tap_service_id: &str) -> TaasResult<Option<u16>> {
            self.inner.unassign(tap_service_id).await
        }

        async fn lookup(&self, tap_service_id: &str) -> TaasResult<Option<u16>> {
            self.inner.lookup(tap_service_id).await
        }
    }

    #[tokio::test]
    async fn test_allocations_are_distinct_and_in_range() {
        let allocator = VlanTagAllocator::new(Arc::new(InMemoryPoolStore::new()), &pool(3900, 3910));
        let mut seen = BTreeSet::new();
        for n in 0..10 {
            let id = allocator.allocate(&format!("svc-{}", n)).await.unwrap();
            assert!((3900..3910).contains(&id));
            assert!(seen.insert(id), "duplicate taas_id {}", id);
        }
    }

    #[tokio::test]
    async fn test_allocate_is_idempotent_per_service() {
        let allocator = VlanTagAllocator::new(Arc::new(InMemoryPoolStore::new()), &pool(3900, 3910));
        let first = allocator.allocate("svc-1").await.unwrap();
        assert_eq!(allocator.allocate("svc-1").await.unwrap(), first);
        assert_eq!(allocator.store().list_assigned().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exhaust_then_release_allows_exactly_one() {
        let allocator = VlanTagAllocator::new(Arc::new(InMemoryPoolStore::new()), &pool(3900, 3903));
        for n in 0..3 {
            allocator.allocate(&format!("svc-{}", n)).await.unwrap();
        }
        assert!(matches!(
            allocator.allocate("svc-x").await,
            Err(TaasError::PoolExhausted { start: 3900, end: 3903 })
        ));

        let freed = allocator.release("svc-1").await.unwrap().unwrap();
        assert_eq!(allocator.allocate("svc-x").await.unwrap(), freed);
        assert!(matches!(
            allocator.allocate("svc-y").await,
            Err(TaasError::PoolExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_unknown_is_noop() {
        let allocator = VlanTagAllocator::new(Arc::new(InMemoryPoolStore::new()), &pool(3900, 3903));
        assert_eq!(allocator.release("svc-unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_cache_rebuilt_on_exhaustion() {
        let store = Arc::new(InMemoryPoolStore::new());
        let allocator = VlanTagAllocator::new(store.clone(), &pool(3900, 3902));
        allocator.allocate("svc-1").await.unwrap();
        allocator.allocate("svc-2").await.unwrap();

        // Freed behind the allocator's back
        store.unassign("svc-1").await.unwrap();
        assert_eq!(allocator.allocate("svc-3").await.unwrap(), 3900);
    }

    #[tokio::test]
    async fn test_conflict_retried_with_fresh_read() {
        let store = Arc::new(RacingStore::new(2));
        let allocator = VlanTagAllocator::new(store.clone(), &pool(3900, 3910));

        let id = allocator.allocate("svc-1").await.unwrap();
        let assigned = store.list_assigned().await.unwrap();
        assert_eq!(assigned.len(), 3);
        assert_eq!(store.lookup("svc-1").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_conflict_retries_are_bounded() {
        let store = Arc::new(RacingStore::new(10));
        let allocator = VlanTagAllocator::new(store.clone(), &pool(3900, 3910));

        let err = allocator.allocate("svc-1").await.unwrap_err();
        assert!(matches!(err, TaasError::AllocationConflict { .. }));
        assert_eq!(store.list_assigned().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_never_collide() {
        let allocator = Arc::new(VlanTagAllocator::new(
            Arc::new(InMemoryPoolStore::new()),
            &pool(3900, 3932),
        ));
        let handles: Vec<_> = (0..32)
            .map(|n| {
                let allocator = allocator.clone();
                tokio::spawn(async move { allocator.allocate(&format!("svc-{}", n)).await })
            })
            .collect();

        let mut ids = BTreeSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 32);
    }
}
