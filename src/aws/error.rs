//! AWS error classification
//!
//! The SDK surfaces service errors as deeply nested types; the engine only
//! cares which `StoreError` category a failure falls into. Service wrappers
//! capture the error code through `ProvideErrorMetadata` at the call site,
//! while the concrete operation type is still known, so one code table
//! covers all five service clients. Scraping the debug rendering remains as
//! a fallback for errors that never carried SDK metadata.

use crate::store::StoreError;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use std::fmt;

/// Coarse categories of AWS service failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwsError {
    /// The addressed resource does not exist
    NotFound,
    /// Rate limited or transiently unavailable; retry with backoff
    Throttled,
    /// Deletion blocked by resources still referencing the target
    DependencyViolation,
    /// Credentials lack the required permission
    AccessDenied,
    /// The request itself was malformed or rejected
    InvalidRequest,
    /// Anything the code table does not know
    Unknown,
}

/// Error codes that mean "not there", across EC2, ECR, IAM, and Batch
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidVpcID.NotFound",
    "InvalidSubnetID.NotFound",
    "InvalidGroup.NotFound",
    "InvalidGroupId.Malformed",
    "InvalidInternetGatewayID.NotFound",
    "InvalidRouteTableID.NotFound",
    "InvalidRouteTableId.NotFound",
    "InvalidRoute.NotFound",
    "InvalidAssociationID.NotFound",
    "InvalidVpcEndpointId.NotFound",
    "InvalidPlacementGroup.Unknown",
    "InvalidPermission.NotFound",
    "RepositoryNotFoundException",
    "LifecyclePolicyNotFoundException",
    "NoSuchEntity",
    "NoSuchEntityException",
    "ResourceNotFoundException",
];

const THROTTLED_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "RequestThrottled",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "InternalError",
    "InternalFailure",
    "InternalServiceError",
    "RequestTimeout",
];

const DEPENDENCY_CODES: &[&str] = &[
    "DependencyViolation",
    "DeleteConflict",
    "DeleteConflictException",
    "ResourceInUseException",
    "RepositoryNotEmptyException",
];

const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "UnauthorizedOperation",
];

/// Service error code captured at a wrapper boundary, kept in the anyhow
/// chain where classification can recover it by downcast.
#[derive(Debug)]
pub struct ServiceErrorCode(pub String);

impl fmt::Display for ServiceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service error code {}", self.0)
    }
}

/// Convert an SDK operation error into an anyhow error carrying its service
/// error code. Must be applied before `.context(...)` erases the concrete
/// operation type.
pub fn sdk_error<E, R>(err: SdkError<E, R>) -> anyhow::Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: fmt::Debug + Send + Sync + 'static,
{
    match err.code().map(str::to_string) {
        Some(code) => anyhow::Error::from(err).context(ServiceErrorCode(code)),
        None => anyhow::Error::from(err),
    }
}

/// Classify a bare service error code
pub fn classify_error_code(code: &str) -> AwsError {
    if NOT_FOUND_CODES.contains(&code) {
        AwsError::NotFound
    } else if THROTTLED_CODES.contains(&code) {
        AwsError::Throttled
    } else if DEPENDENCY_CODES.contains(&code) {
        AwsError::DependencyViolation
    } else if ACCESS_DENIED_CODES.contains(&code) {
        AwsError::AccessDenied
    } else if code.starts_with("InvalidParameter") || code == "ValidationError" {
        AwsError::InvalidRequest
    } else {
        AwsError::Unknown
    }
}

/// Classify an error chain.
///
/// The structured code attached by `sdk_error` wins; the debug-rendering
/// scrape only covers errors built without SDK metadata.
pub fn classify_anyhow_error(err: &anyhow::Error) -> AwsError {
    if let Some(ServiceErrorCode(code)) = err.downcast_ref::<ServiceErrorCode>() {
        return classify_error_code(code);
    }
    let rendered = format!("{err:?}");
    match extract_error_code(&rendered) {
        Some(code) => classify_error_code(&code),
        // Connection-level failures never reach a service error code
        None if rendered.contains("timeout") || rendered.contains("connection") => {
            AwsError::Throttled
        }
        None => AwsError::Unknown,
    }
}

/// Convert an error from a service wrapper into the engine's store error
pub fn to_store_error(err: anyhow::Error) -> StoreError {
    match classify_anyhow_error(&err) {
        AwsError::NotFound => StoreError::NotFound,
        AwsError::Throttled => StoreError::Transient(format!("{err:#}")),
        AwsError::DependencyViolation => StoreError::DependentResourceExists {
            dependents: vec![format!("{err:#}")],
        },
        AwsError::AccessDenied | AwsError::InvalidRequest | AwsError::Unknown => {
            StoreError::Rejected(format!("{err:#}"))
        }
    }
}

fn extract_error_code(rendered: &str) -> Option<String> {
    for marker in ["code: \"", "code: Some(\""] {
        if let Some(start) = rendered.find(marker) {
            let rest = &rendered[start + marker.len()..];
            if let Some(end) = rest.find('"') {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_table_covers_the_services() {
        assert_eq!(
            classify_error_code("InvalidVpcID.NotFound"),
            AwsError::NotFound
        );
        assert_eq!(
            classify_error_code("RepositoryNotFoundException"),
            AwsError::NotFound
        );
        assert_eq!(classify_error_code("Throttling"), AwsError::Throttled);
        assert_eq!(
            classify_error_code("DependencyViolation"),
            AwsError::DependencyViolation
        );
        assert_eq!(
            classify_error_code("UnauthorizedOperation"),
            AwsError::AccessDenied
        );
        assert_eq!(classify_error_code("SomethingNew"), AwsError::Unknown);
    }

    #[test]
    fn codes_are_extracted_from_debug_renderings() {
        let err = anyhow::anyhow!(
            "service error: ErrorMetadata {{ code: \"DependencyViolation\", message: \"vpc has dependencies\" }}"
        );
        assert_eq!(classify_anyhow_error(&err), AwsError::DependencyViolation);

        let store_err = to_store_error(err);
        assert!(matches!(
            store_err,
            StoreError::DependentResourceExists { .. }
        ));
    }

    #[test]
    fn structured_code_wins_over_the_rendering() {
        // The rendering mentions no recognizable code at all; the attached
        // ServiceErrorCode still classifies it.
        let err = anyhow::anyhow!("dispatch failure")
            .context(ServiceErrorCode("InvalidVpcID.NotFound".into()))
            .context("failed to describe vpc");
        assert_eq!(classify_anyhow_error(&err), AwsError::NotFound);
        assert!(to_store_error(err).is_not_found());
    }

    #[test]
    fn throttles_map_to_transient() {
        let err = anyhow::anyhow!("ErrorMetadata {{ code: \"RequestLimitExceeded\" }}");
        assert!(to_store_error(err).is_retryable());
    }
}
