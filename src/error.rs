//! Error handling for campipe
//!
//! This module defines the crate-wide error type and a Result alias. Errors
//! that belong to the graph/engine layer live in [`crate::pipeline::PipelineError`]
//! and convert into [`CampipeError`] with `?`.

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for campipe operations
#[derive(Error, Debug)]
pub enum CampipeError {
    /// Errors raised by the orchestration engine
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration loading/saving/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// A capture request was rejected before any frame was built
    #[error("Request {key} rejected: {reason}")]
    InvalidRequest { key: u64, reason: String },

    /// The operation is not allowed in the current device state
    #[error("Invalid device state: expected {expected}, found {found}")]
    InvalidState { expected: String, found: String },

    /// Buffer authority failures
    #[error("Buffer error: {0}")]
    Buffer(String),

    /// Hardware stage driver failures
    #[error("Driver error on {stage}: {message}")]
    Driver { stage: String, message: String },

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CampipeError>,
    },
}

impl CampipeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CampipeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a driver error
    pub fn driver(stage: impl std::fmt::Display, message: impl Into<String>) -> Self {
        CampipeError::Driver {
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for CampipeError {
    fn from(err: toml::de::Error) -> Self {
        CampipeError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for CampipeError {
    fn from(err: toml::ser::Error) -> Self {
        CampipeError::Serialization(err.to_string())
    }
}

/// Result type alias for campipe operations
pub type Result<T> = std::result::Result<T, CampipeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<CampipeError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageId;

    #[test]
    fn test_error_display() {
        let err = CampipeError::Config("batch_size must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: batch_size must be at least 1"
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = CampipeError::Buffer("pool exhausted".to_string());
        let with_ctx = err.with_context("Failed to attach preview buffer");
        assert!(with_ctx.to_string().contains("Failed to attach preview buffer"));
        assert!(with_ctx.to_string().contains("pool exhausted"));
    }

    #[test]
    fn test_pipeline_error_converts() {
        fn build() -> Result<()> {
            Err(PipelineError::InconsistentTable {
                stage: StageId::Isp,
                reason: "upstream bayer is not active".to_string(),
            })?;
            Ok(())
        }
        let err = build().unwrap_err();
        assert!(matches!(err, CampipeError::Pipeline(_)));
        assert!(err.to_string().contains("isp"));
    }

    #[test]
    fn test_result_ext_context() {
        let res: std::result::Result<(), PipelineError> = Err(PipelineError::NotRunning);
        let err = res.context("submit").unwrap_err();
        assert!(err.to_string().starts_with("submit: "));
    }
}
