//! In-memory pool store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use taas_common::pool::PoolStore;
use taas_common::{TaasError, TaasResult};

#[derive(Debug, Default)]
struct Assignments {
    by_id: BTreeMap<u16, String>,
    by_service: HashMap<String, u16>,
}

/// Pool store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryPoolStore {
    inner: Mutex<Assignments>,
}

impl InMemoryPoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> TaasResult<std::sync::MutexGuard<'_, Assignments>> {
        self.inner
            .lock()
            .map_err(|_| TaasError::internal("pool store lock poisoned"))
    }
}

#[async_trait]
impl PoolStore for InMemoryPoolStore {
    async fn list_assigned(&self) -> TaasResult<BTreeSet<u16>> {
        Ok(self.lock()?.by_id.keys().copied().collect())
    }

    async fn try_assign(&self, taas_id: u16, tap_service_id: &str) -> TaasResult<bool> {
        let mut inner = self.lock()?;
        if inner.by_id.contains_key(&taas_id) || inner.by_service.contains_key(tap_service_id) {
            return Ok(false);
        }
        inner.by_id.insert(taas_id, tap_service_id.to_string());
        inner.by_service.insert(tap_service_id.to_string(), taas_id);
        Ok(true)
    }

    async fn unassign(&self, tap_service_id: &str) -> TaasResult<Option<u16>> {
        let mut inner = self.lock()?;
        let taas_id = inner.by_service.remove(tap_service_id);
        if let Some(id) = taas_id {
            inner.by_id.remove(&id);
        }
        Ok(taas_id)
    }

    async fn lookup(&self, tap_service_id: &str) -> TaasResult<Option<u16>> {
        Ok(self.lock()?.by_service.get(tap_service_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_assign_is_exclusive() {
        let store = InMemoryPoolStore::new();
        assert!(store.try_assign(3901, "svc-1").await.unwrap());
        assert!(!store.try_assign(3901, "svc-2").await.unwrap());
        assert!(!store.try_assign(3902, "svc-1").await.unwrap());

        assert_eq!(store.lookup("svc-1").await.unwrap(), Some(3901));
        assert_eq!(
            store.list_assigned().await.unwrap(),
            BTreeSet::from([3901])
        );
    }

    #[tokio::test]
    async fn test_unassign() {
        let store = InMemoryPoolStore::new();
        store.try_assign(3901, "svc-1").await.unwrap();
        assert_eq!(store.unassign("svc-1").await.unwrap(), Some(3901));
        assert_eq!(store.unassign("svc-1").await.unwrap(), None);
        assert!(store.list_assigned().await.unwrap().is_empty());
        assert!(store.try_assign(3901, "svc-2").await.unwrap());
    }
}
