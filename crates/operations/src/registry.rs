//! Seam through which operations are mirrored into cluster-wide records

use async_trait::async_trait;

use crate::types::{Operation, OperationStatus};

/// Error type returned by registry implementations
pub type RegistryError = Box<dyn std::error::Error + Send + Sync>;

/// Receives operation lifecycle events so other members can find an
/// operation's owner. Failures are logged by the engine and never abort work.
#[async_trait]
pub trait OperationRegistry: Send + Sync + 'static {
    /// A new operation was created
    async fn register(&self, operation: &Operation) -> Result<(), RegistryError>;

    /// An operation changed status
    async fn update_status(&self, id: &str, status: OperationStatus) -> Result<(), RegistryError>;

    /// An operation was reaped
    async fn forget(&self, id: &str) -> Result<(), RegistryError>;
}

/// Registry for engines that are not part of a cluster
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistry;

#[async_trait]
impl OperationRegistry for NoopRegistry {
    async fn register(&self, _operation: &Operation) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn update_status(
        &self,
        _id: &str,
        _status: OperationStatus,
    ) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn forget(&self, _id: &str) -> Result<(), RegistryError> {
        Ok(())
    }
}
