use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use finflow_core::TenantId;

/// Tenant-isolated key/value store.
///
/// Every operation takes the tenant explicitly; there is no way to read or
/// list across tenants.
pub trait TenantStore<K, V>: Send + Sync {
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V>;
    fn upsert(&self, tenant_id: TenantId, key: K, value: V);

    /// Read-modify-write under one lock. `f` receives the current value (if
    /// any) and returns the value to store, or `None` to leave it untouched.
    fn update(&self, tenant_id: TenantId, key: K, f: &mut dyn FnMut(Option<&V>) -> Option<V>);

    fn list(&self, tenant_id: TenantId) -> Vec<V>;
    /// Drop every record of a tenant (rebuild support).
    fn clear_tenant(&self, tenant_id: TenantId);
}

impl<K, V, S> TenantStore<K, V> for Arc<S>
where
    S: TenantStore<K, V> + ?Sized,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V> {
        (**self).get(tenant_id, key)
    }

    fn upsert(&self, tenant_id: TenantId, key: K, value: V) {
        (**self).upsert(tenant_id, key, value)
    }

    fn update(&self, tenant_id: TenantId, key: K, f: &mut dyn FnMut(Option<&V>) -> Option<V>) {
        (**self).update(tenant_id, key, f)
    }

    fn list(&self, tenant_id: TenantId) -> Vec<V> {
        (**self).list(tenant_id)
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        (**self).clear_tenant(tenant_id)
    }
}

/// In-memory implementation backed by a `RwLock<HashMap>`.
///
/// A poisoned lock reads as empty and drops writes; read models are
/// rebuildable from the event store.
#[derive(Debug)]
pub struct InMemoryTenantStore<K, V> {
    inner: RwLock<HashMap<(TenantId, K), V>>,
}

impl<K, V> InMemoryTenantStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryTenantStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TenantStore<K, V> for InMemoryTenantStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V> {
        let map = self.inner.read().ok()?;
        map.get(&(tenant_id, key.clone())).cloned()
    }

    fn upsert(&self, tenant_id: TenantId, key: K, value: V) {
        if let Ok(mut map) = self.inner.write() {
            map.insert((tenant_id, key), value);
        }
    }

    fn update(&self, tenant_id: TenantId, key: K, f: &mut dyn FnMut(Option<&V>) -> Option<V>) {
        let Ok(mut map) = self.inner.write() else {
            return;
        };
        let key = (tenant_id, key);
        if let Some(next) = f(map.get(&key)) {
            map.insert(key, next);
        }
    }

    fn list(&self, tenant_id: TenantId) -> Vec<V> {
        let Ok(map) = self.inner.read() else {
            return vec![];
        };

        map.iter()
            .filter(|((t, _), _)| *t == tenant_id)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut map) = self.inner.write() {
            map.retain(|(t, _), _| *t != tenant_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenants_never_see_each_other() {
        let store: InMemoryTenantStore<&'static str, u64> = InMemoryTenantStore::new();
        let a = TenantId::new();
        let b = TenantId::new();

        store.upsert(a, "INV-1", 100);
        store.upsert(b, "INV-1", 200);

        assert_eq!(store.get(a, &"INV-1"), Some(100));
        assert_eq!(store.get(b, &"INV-1"), Some(200));
        assert_eq!(store.list(a), vec![100]);

        store.clear_tenant(a);
        assert!(store.list(a).is_empty());
        assert_eq!(store.list(b), vec![200]);
    }

    #[test]
    fn update_sees_current_value_and_can_skip() {
        let store: InMemoryTenantStore<u8, u64> = InMemoryTenantStore::new();
        let t = TenantId::new();

        store.update(t, 1, &mut |cur| Some(cur.copied().unwrap_or(0) + 5));
        store.update(t, 1, &mut |cur| Some(cur.copied().unwrap_or(0) + 5));
        store.update(t, 2, &mut |_| None);

        assert_eq!(store.get(t, &1), Some(10));
        assert_eq!(store.get(t, &2), None);
    }
}
