//! Abstract dependency resolving instance identity to an SSH endpoint and
//! authorizing this fleet's keypair on the agent. Implemented by the
//! (out-of-scope) control-plane binary against its own orchestrator
//! abstraction (Kubernetes/Docker); this crate only depends on the
//! contract.

use async_trait::async_trait;

use crate::error::SshCoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Creating,
    Error,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Resolves an instance name to its SSH host and port.
    async fn get_ssh_address(&self, instance: &str) -> Result<(String, u16), SshCoreError>;

    /// Installs `public_key_text` into the instance's authorized_keys.
    /// Must be idempotent: repeated calls with the same key are no-ops.
    async fn configure_ssh_access(
        &self,
        instance: &str,
        public_key_text: &str,
    ) -> Result<(), SshCoreError>;

    /// Reports the orchestrator's view of the instance's lifecycle state,
    /// independent of whether this crate currently holds a live SSH
    /// connection to it.
    async fn get_instance_status(&self, instance: &str) -> Result<InstanceStatus, SshCoreError>;

    /// Enumerates every instance the orchestrator currently knows about,
    /// used by the maintenance loop's reconciliation pass.
    async fn list_instances(&self) -> Result<Vec<String>, SshCoreError>;
}
