//! Error classification for EC2 API calls.

use aws_sdk_ec2::error::ProvideErrorMetadata;
use thiserror::Error;

use crate::provider::TransientError;

/// EC2 error codes meaning the named resource does not exist.
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidVolume.NotFound",
    "InvalidAMIID.NotFound",
    "InvalidAMIID.Unavailable",
    "InvalidKeyPair.NotFound",
    "InvalidGroup.NotFound",
];

const THROTTLING_CODES: &[&str] = &["Throttling", "ThrottlingException", "RequestLimitExceeded"];

const DEPENDENCY_CODES: &[&str] = &["DependencyViolation"];

/// Errors raised by [`super::Ec2Provider`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Ec2ProviderError {
    /// The addressed resource does not exist.
    #[error("{operation}: not found ({code}): {message}")]
    NotFound {
        /// API operation that was called.
        operation: &'static str,
        /// EC2 error code.
        code: String,
        /// Message returned by EC2.
        message: String,
    },
    /// EC2 rejected the call because of request rate.
    #[error("{operation}: rate limited by EC2: {message}")]
    Throttled {
        /// API operation that was called.
        operation: &'static str,
        /// Message returned by EC2.
        message: String,
    },
    /// The resource is still referenced by another resource.
    #[error("{operation}: resource still in use: {message}")]
    DependencyViolation {
        /// API operation that was called.
        operation: &'static str,
        /// Message returned by EC2.
        message: String,
    },
    /// Any other API or transport failure.
    #[error("{operation} failed{}: {message}", code.as_deref().map(|code| format!(" ({code})")).unwrap_or_default())]
    Api {
        /// API operation that was called.
        operation: &'static str,
        /// EC2 error code, when the failure came from the service.
        code: Option<String>,
        /// Message returned by EC2 or the transport.
        message: String,
    },
    /// A successful response lacked a field the workflow needs.
    #[error("{operation} response is missing {field}")]
    MissingField {
        /// API operation that was called.
        operation: &'static str,
        /// Missing response field.
        field: &'static str,
    },
    /// A value could not be expressed in the EC2 API.
    #[error("invalid {what}: {value}")]
    InvalidInput {
        /// Parameter being converted.
        what: &'static str,
        /// Offending value.
        value: String,
    },
}

impl Ec2ProviderError {
    /// Classifies an EC2 error by its code.
    #[must_use]
    pub fn classify(operation: &'static str, code: Option<&str>, message: Option<&str>) -> Self {
        let message = message.unwrap_or("unknown error").to_owned();
        match code {
            Some(code) if NOT_FOUND_CODES.contains(&code) => Self::NotFound {
                operation,
                code: code.to_owned(),
                message,
            },
            Some(code) if THROTTLING_CODES.contains(&code) => Self::Throttled { operation, message },
            Some(code) if DEPENDENCY_CODES.contains(&code) => {
                Self::DependencyViolation { operation, message }
            }
            _ => Self::Api {
                operation,
                code: code.map(str::to_owned),
                message,
            },
        }
    }

    /// Builds an error from any SDK error exposing EC2 metadata.
    pub(crate) fn from_sdk<E>(operation: &'static str, err: &E) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error,
    {
        let fallback = aws_sdk_ec2::error::DisplayErrorContext(err).to_string();
        Self::classify(
            operation,
            err.code(),
            Some(err.message().unwrap_or(fallback.as_str())),
        )
    }

    /// Returns `true` when the addressed resource does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` for failures worth retrying later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. } | Self::DependencyViolation { .. }
        )
    }
}

impl TransientError for Ec2ProviderError {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}
