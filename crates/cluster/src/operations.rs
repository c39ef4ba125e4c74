//! Cluster-wide operation records
//!
//! The local operation engine mirrors every operation into the replicated
//! state so other members can find out who owns it. An operation whose owner
//! stopped heartbeating is reported as failed instead of lingering forever.

use async_trait::async_trait;
use hearth_operations::{Operation, OperationRegistry, OperationStatus, RegistryError};
use serde::Serialize;

use crate::error::{ClusterResult, Error};
use crate::state::{ClusterState, OperationRecord};
use crate::store::ClusterStore;

/// Operation record as seen from anywhere in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterOperation {
    /// Stored record
    #[serde(flatten)]
    pub record: OperationRecord,
    /// Name of the owning member, empty if it left the cluster
    pub location: String,
}

impl ClusterStore {
    /// Look up an operation record. Non-terminal records owned by a member
    /// that is offline at `now` (unix millis) report `failure`.
    pub fn operation_record(&self, id: &str, now: i64) -> ClusterResult<ClusterOperation> {
        self.read(|state| {
            state
                .operation(id)
                .map(|record| self.resolve_record(state, record, now))
        })
        .ok_or_else(|| Error::not_found(format!("Operation {id:?} not found")))
    }

    /// All operation records, resolved as in [`ClusterStore::operation_record`]
    pub fn operation_records(&self, now: i64) -> Vec<ClusterOperation> {
        self.read(|state| {
            state
                .operations()
                .map(|record| self.resolve_record(state, record, now))
                .collect()
        })
    }

    fn resolve_record(
        &self,
        state: &ClusterState,
        record: &OperationRecord,
        now: i64,
    ) -> ClusterOperation {
        let owner = state.member_by_id(record.member_id);
        let online = owner.is_some_and(|member| member.is_online(now, self.offline_threshold));

        let mut record = record.clone();
        if !online && !record.status.is_final() {
            record.status = OperationStatus::Failure;
        }

        ClusterOperation {
            record,
            location: owner.map(|member| member.name.clone()).unwrap_or_default(),
        }
    }
}

#[async_trait]
impl OperationRegistry for ClusterStore {
    async fn register(&self, operation: &Operation) -> Result<(), RegistryError> {
        let owner = self.member_name().to_string();

        self.transaction(self.transaction_timeout, |tx| {
            let member_id = tx.get_member_id(&owner)?;
            tx.put_operation(OperationRecord {
                id: operation.id.clone(),
                member_id,
                class: operation.class,
                description: operation.description.clone(),
                status: operation.status,
            });
            Ok(())
        })
        .await?;

        Ok(())
    }

    async fn update_status(&self, id: &str, status: OperationStatus) -> Result<(), RegistryError> {
        self.transaction(self.transaction_timeout, |tx| {
            let mut record = tx.operation(id)?;
            record.status = status;
            tx.put_operation(record);
            Ok(())
        })
        .await?;

        Ok(())
    }

    async fn forget(&self, id: &str) -> Result<(), RegistryError> {
        self.transaction(self.transaction_timeout, |tx| {
            if tx.operation(id).is_ok() {
                tx.delete_operation(id);
            }
            Ok(())
        })
        .await?;

        Ok(())
    }
}
