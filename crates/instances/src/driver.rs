//! Capability seam to the instance runtime

use async_trait::async_trait;
use hearth_cluster::{Instance, InstanceSnapshot};
use hearth_operations::{OperationContext, WorkError};
use tracing::debug;

/// Runtime operations backing snapshot commands.
///
/// Calls run inside an operation's work and may report progress or observe
/// cancellation through `ctx`.
#[async_trait]
pub trait InstanceDriver: Send + Sync + 'static {
    /// Capture a snapshot of `instance`
    async fn snapshot(
        &self,
        ctx: &OperationContext,
        instance: &Instance,
        name: &str,
        stateful: bool,
    ) -> Result<(), WorkError>;

    /// Remove a snapshot's data
    async fn delete_snapshot(
        &self,
        ctx: &OperationContext,
        instance: &Instance,
        name: &str,
    ) -> Result<(), WorkError>;

    /// Rename a snapshot's data
    async fn rename_snapshot(
        &self,
        ctx: &OperationContext,
        instance: &Instance,
        from: &str,
        to: &str,
    ) -> Result<(), WorkError>;

    /// Roll `instance` back to `snapshot`
    async fn restore(
        &self,
        ctx: &OperationContext,
        instance: &Instance,
        snapshot: &InstanceSnapshot,
        stateful: bool,
    ) -> Result<(), WorkError>;
}

/// Driver for members without a local runtime; only records change
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordOnlyDriver;

#[async_trait]
impl InstanceDriver for RecordOnlyDriver {
    async fn snapshot(
        &self,
        ctx: &OperationContext,
        instance: &Instance,
        name: &str,
        _stateful: bool,
    ) -> Result<(), WorkError> {
        debug!("Operation {}: snapshot {}/{}", ctx.id(), instance.name, name);
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        ctx: &OperationContext,
        instance: &Instance,
        name: &str,
    ) -> Result<(), WorkError> {
        debug!("Operation {}: delete {}/{}", ctx.id(), instance.name, name);
        Ok(())
    }

    async fn rename_snapshot(
        &self,
        ctx: &OperationContext,
        instance: &Instance,
        from: &str,
        to: &str,
    ) -> Result<(), WorkError> {
        debug!(
            "Operation {}: rename {}/{} to {}",
            ctx.id(),
            instance.name,
            from,
            to
        );
        Ok(())
    }

    async fn restore(
        &self,
        ctx: &OperationContext,
        instance: &Instance,
        snapshot: &InstanceSnapshot,
        _stateful: bool,
    ) -> Result<(), WorkError> {
        debug!(
            "Operation {}: restore {} from {}",
            ctx.id(),
            instance.name,
            snapshot.name
        );
        Ok(())
    }
}
