//! Network allocation tracking for hearth
//!
//! The [`AllocationAggregator`] walks projects and networks and merges
//! addresses reported by network drivers with forwards and load-balancers
//! recorded in the cluster store.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Allocation ledger
pub mod allocation;

/// Project and network enumeration
pub mod directory;

/// Network driver capabilities
pub mod driver;

/// Error types
pub mod error;

pub use allocation::{AllocationAggregator, AllocationFilter, AllocationType, NetworkAllocation};
pub use directory::NetworkDirectory;
pub use driver::{
    ClientType, Lease, LeaseKind, NetworkDriver, NetworkLoader, StoreNetworkLoader, StoredNetwork,
};
pub use error::{NetworkError, NetworkResult};
