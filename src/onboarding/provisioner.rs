//! Identity Provisioner contract: assigns permanent subscriber identities.

use async_trait::async_trait;

use crate::error::ProvisionError;

/// External capability returning a permanent identity (IMSI) for a plan.
#[async_trait]
pub trait IdentityProvisioner: Send + Sync {
    async fn provision(&self, plan_code: &str, business_ref: &str) -> Result<String, ProvisionError>;
}
