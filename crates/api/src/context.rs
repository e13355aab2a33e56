use finflow_core::{PartyId, TenantId};

/// Who is calling, and on behalf of which tenant.
///
/// Authentication happens upstream; the gateway forwards the resolved
/// tenant and party as headers and this is built from them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RequestContext {
    tenant_id: TenantId,
    actor: PartyId,
}

impl RequestContext {
    pub fn new(tenant_id: TenantId, actor: PartyId) -> Self {
        Self { tenant_id, actor }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn actor(&self) -> PartyId {
        self.actor
    }
}
