use std::time::Duration;

/// Operation engine configuration
#[derive(Debug, Clone)]
pub struct OperationsConfig {
    /// Name of the member driving operations created by this engine
    pub location: String,

    /// How long a terminal operation stays queryable before it is reaped
    pub retention: Duration,

    /// How often the reaper looks for expired operations
    pub reap_interval: Duration,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            location: "none".to_string(),
            retention: Duration::from_secs(5),
            reap_interval: Duration::from_secs(1),
        }
    }
}
