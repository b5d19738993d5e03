// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for vmsnap resource handling
#[derive(Error, Debug, Diagnostic)]
pub enum CoreError {
    /// A required field is missing from a resource
    #[error("Missing required field: {field}")]
    #[diagnostic(
        code(vmsnap::missing_field),
        help("Set '{field}' on the resource before submitting it")
    )]
    MissingField {
        #[allow(unused)]
        field: String,
    },

    /// Resource name is not a valid DNS-1123 subdomain
    #[error("Invalid resource name: {name}")]
    #[diagnostic(
        code(vmsnap::invalid_name),
        help("Names must be lowercase alphanumeric, '-' or '.', and start and end with an alphanumeric character")
    )]
    InvalidName {
        #[allow(unused)]
        name: String,
    },

    /// Unknown or unsupported resource kind
    #[error("Unknown resource kind: {kind}")]
    #[diagnostic(
        code(vmsnap::invalid_kind),
        help("Supported snapshot source kinds: VirtualMachine")
    )]
    InvalidKind {
        #[allow(unused)]
        kind: String,
    },

    /// VM declares both `running` and `runStrategy`
    #[error("Invalid run strategy for {resource}: {reason}")]
    #[diagnostic(
        code(vmsnap::invalid_run_strategy),
        help("Set either spec.running or spec.runStrategy on the VirtualMachine, not both")
    )]
    InvalidRunStrategy {
        #[allow(unused)]
        resource: String,
        #[allow(unused)]
        reason: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(vmsnap::serialization_error),
        help("Ensure the resource format is valid JSON or YAML")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(vmsnap::internal_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create a MissingField error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Create an InvalidName error
    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName { name: name.into() }
    }

    /// Create an InvalidKind error
    pub fn invalid_kind(kind: impl Into<String>) -> Self {
        Self::InvalidKind { kind: kind.into() }
    }

    /// Create an InvalidRunStrategy error
    pub fn invalid_run_strategy(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRunStrategy {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Create a SerializationError
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Errors that will keep failing until the user fixes the resource spec
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidKind { .. } | Self::InvalidRunStrategy { .. }
        )
    }
}
