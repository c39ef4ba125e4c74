//! Error types for the mock network implementation.

use thiserror::Error;

/// Error type for the mock network implementation.
#[derive(Debug, Error)]
pub enum Error {
    /// Error when loading or parsing the fixture file.
    #[error("Fixture file error: {0}")]
    FixtureFile(String),
}
