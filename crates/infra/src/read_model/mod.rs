//! Tenant-isolated storage for disposable read models and adapter state.

pub mod tenant_store;

pub use tenant_store::{InMemoryTenantStore, TenantStore};
