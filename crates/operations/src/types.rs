//! Operation model

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Affected entities keyed by kind (e.g. `instances`), each a list of API URLs
pub type Resources = BTreeMap<String, Vec<String>>;

/// How an operation reaches completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// Runs attached work to completion
    Task,
    /// Waits for an external party to complete it
    Token,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Token => write!(f, "token"),
        }
    }
}

/// Operation status.
///
/// `Created` and `Running` are the only non-terminal states; once a terminal
/// state is reached it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Accepted, work not started
    Created,
    /// Work in progress
    Running,
    /// Completed successfully
    Success,
    /// Completed with an error
    Failure,
    /// Cancelled before completion
    Cancelled,
}

impl OperationStatus {
    /// Whether the status is terminal
    pub fn is_final(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }

    /// Numeric status code exposed on the API
    pub fn code(self) -> u16 {
        match self {
            Self::Created => 100,
            Self::Running => 103,
            Self::Success => 200,
            Self::Failure => 400,
            Self::Cancelled => 401,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "Pending",
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Cancelled => "Cancelled",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of an operation as served to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Opaque operation ID
    pub id: String,
    /// Operation class
    pub class: OperationClass,
    /// Type tag (e.g. "Creating snapshot")
    pub description: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last time status or metadata changed
    pub updated_at: DateTime<Utc>,
    /// Current status
    pub status: OperationStatus,
    /// Numeric form of `status`
    pub status_code: u16,
    /// Affected entities
    pub resources: Resources,
    /// Free-form progress metadata
    pub metadata: Map<String, Value>,
    /// Whether the operation accepts cancellation right now
    pub may_cancel: bool,
    /// Error captured from failed work, verbatim
    pub err: String,
    /// Member driving the operation
    pub location: String,
}

impl Operation {
    /// Outcome of a terminal operation; `None` while it is still in flight
    pub fn outcome(&self) -> Option<Result<(), String>> {
        match self.status {
            OperationStatus::Success => Some(Ok(())),
            OperationStatus::Failure | OperationStatus::Cancelled => Some(Err(self.err.clone())),
            _ => None,
        }
    }

    /// API path of this operation
    pub fn url(&self) -> String {
        format!("/1.0/operations/{}", self.id)
    }
}
