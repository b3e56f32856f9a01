use thiserror::Error;

/// Ferry error types
#[derive(Error, Debug)]
pub enum FerryError {
    /// A request parameter is malformed or outside the supported subset
    #[error("parameter {name}={value:?} is not supported: {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    /// A recognized Docker API feature that ferry does not implement
    #[error("{0} is not supported")]
    NotImplemented(String),

    /// Registry credential header could not be decoded
    #[error("Registry credentials error: {0}")]
    Credentials(String),

    /// The cluster refused to create a resource
    #[error("Creating {resource} failed: {message}")]
    Admission { resource: String, message: String },

    /// A workload reached the Failed phase or exited non-zero
    #[error("Workload {name} failed (phase {phase})")]
    WorkloadFailed { name: String, phase: String },

    /// A pod or workload the caller relies on does not exist
    #[error("Workload not found: {0}")]
    WorkloadNotFound(String),

    /// The caller went away or the execution deadline passed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Chunk existence check or upload failed
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// A manifest names a chunk the store does not hold
    #[error("Chunk {0} is missing from the store")]
    MissingChunk(String),

    /// Object store error
    #[error("Store error: {0}")]
    Store(String),

    /// Cluster API error
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// In-process execution failed
    #[error("Local execution failed: {0}")]
    LocalExecution(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Error categories, in the order they can occur while serving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad or unsupported request parameters, answered with 4xx.
    Validation,
    /// Undecodable registry auth headers.
    Credentials,
    /// Workload or secret creation refused by the cluster.
    Admission,
    /// The workload ran and failed, or was cancelled.
    Execution,
    /// Chunk lookups, uploads and context reconstruction.
    Transfer,
    /// Everything else.
    Internal,
}

impl FerryError {
    /// Shorthand for [`FerryError::InvalidParameter`].
    pub fn invalid_parameter(
        name: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        FerryError::InvalidParameter {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            FerryError::InvalidParameter { .. } | FerryError::NotImplemented(_) => {
                ErrorCategory::Validation
            }
            FerryError::Credentials(_) => ErrorCategory::Credentials,
            FerryError::Admission { .. } => ErrorCategory::Admission,
            FerryError::WorkloadFailed { .. }
            | FerryError::WorkloadNotFound(_)
            | FerryError::Cancelled(_)
            | FerryError::LocalExecution(_) => ErrorCategory::Execution,
            FerryError::Transfer(_) | FerryError::MissingChunk(_) | FerryError::Store(_) => {
                ErrorCategory::Transfer
            }
            _ => ErrorCategory::Internal,
        }
    }

    /// Whether this error was caused by cancellation or the execution deadline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FerryError::Cancelled(_))
    }
}

impl From<serde_json::Error> for FerryError {
    fn from(err: serde_json::Error) -> Self {
        FerryError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for FerryError {
    fn from(err: serde_yaml::Error) -> Self {
        FerryError::Serialization(err.to_string())
    }
}

/// Result type alias for ferry operations
pub type Result<T> = std::result::Result<T, FerryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_parameter_display() {
        let error = FerryError::invalid_parameter("cpushares", "512", "expected 0");
        assert_eq!(
            error.to_string(),
            "parameter cpushares=\"512\" is not supported: expected 0"
        );
    }

    #[test]
    fn test_not_implemented_display() {
        let error = FerryError::NotImplemented("platform".to_string());
        assert_eq!(error.to_string(), "platform is not supported");
    }

    #[test]
    fn test_admission_error_display() {
        let error = FerryError::Admission {
            resource: "pod".to_string(),
            message: "quota exceeded".to_string(),
        };
        assert_eq!(error.to_string(), "Creating pod failed: quota exceeded");
    }

    #[test]
    fn test_workload_failed_display() {
        let error = FerryError::WorkloadFailed {
            name: "ferry-push-x7k2p".to_string(),
            phase: "Failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Workload ferry-push-x7k2p failed (phase Failed)"
        );
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            FerryError::invalid_parameter("rm", "2", "x").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            FerryError::NotImplemented("repo".into()).category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            FerryError::Credentials("bad".into()).category(),
            ErrorCategory::Credentials
        );
        assert_eq!(
            FerryError::Admission {
                resource: "secret".into(),
                message: "denied".into()
            }
            .category(),
            ErrorCategory::Admission
        );
        assert_eq!(
            FerryError::Cancelled("deadline".into()).category(),
            ErrorCategory::Execution
        );
        assert_eq!(
            FerryError::MissingChunk("ab".into()).category(),
            ErrorCategory::Transfer
        );
        assert_eq!(
            FerryError::Other("x".into()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_workload_not_found_is_distinguishable() {
        let error = FerryError::WorkloadNotFound("ferry-build-abc".to_string());
        assert!(matches!(error, FerryError::WorkloadNotFound(ref n) if n == "ferry-build-abc"));
        assert!(!error.is_cancelled());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: FerryError = io_error.into();
        assert!(matches!(error, FerryError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let error: FerryError = result.unwrap_err().into();
        assert!(matches!(error, FerryError::Serialization(_)));
    }
}
