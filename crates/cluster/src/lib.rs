//! Cluster membership and replicated state for hearth
//!
//! This crate provides:
//! - The member model and role assignment ([`MemberRegistry`])
//! - Leader-aware transactions over the replicated log ([`ClusterStore`])
//! - The consensus log seam and its in-process implementation
//! - Join-token decoding and join target resolution

#![warn(missing_docs)]
#![warn(clippy::all)]

/// API URL helpers
pub mod api;

/// Member configuration
pub mod config;

/// Consensus log
pub mod consensus;

/// Error types
pub mod error;

/// Join-token exchange
pub mod join;

/// Member model
pub mod member;

/// Cluster-wide operation records
pub mod operations;

/// Membership and role assignment
pub mod registry;

/// Replicated state machine
pub mod state;

/// Transactional store
pub mod store;

pub use api::{api_url, is_true};
pub use config::{ClusterConfig, RoleConfig, SCHEMA_VERSION};
pub use consensus::{Commit, Consensus, MemoryConsensus};
pub use error::{ClusterResult, Error, ErrorKind};
pub use join::{CertificateFetcher, JoinTarget, JoinToken, resolve_join_target};
pub use member::{ClusterMember, MemberId, Role, STANDALONE_ADDRESS};
pub use operations::ClusterOperation;
pub use registry::{Activation, Eviction, MemberRegistry, RoleChange, plan_roles, resolve_address};
pub use state::{
    ClusterState, DEFAULT_PROJECT, Instance, InstanceSnapshot, Network, NetworkForward,
    NetworkLoadBalancer, OperationRecord, Project,
};
pub use store::{ClusterStore, ClusterTx, NewMember};

/// Current wall clock time in unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
