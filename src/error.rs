//! Provisioning error taxonomy
//!
//! Typed errors for the apply/rollback engine. Structural errors
//! (`CycleDetected`, `UnresolvedReference`) halt before or during the walk,
//! convergence and remote errors carry the logical name and kind of the
//! resource that failed so an operator can resume.

use crate::descriptor::ResourceKind;
use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by graph building, apply, teardown, and output resolution
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The descriptor set contains a reference cycle; no apply is attempted
    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// A reference could not be substituted at apply time.
    ///
    /// With a correctly ordered graph this cannot happen; it is an engine
    /// invariant violation, not a user error.
    #[error("unresolved reference from '{resource}' to '{target}.{attribute}'")]
    UnresolvedReference {
        resource: String,
        target: String,
        attribute: String,
    },

    /// The remote resource never reached the expected state within the
    /// polling budget. Retryable by re-invoking apply.
    #[error("{kind} '{resource}' did not converge within {waited_secs}s")]
    ConvergenceTimeout {
        resource: String,
        kind: ResourceKind,
        waited_secs: u64,
    },

    /// A remote call kept failing after bounded local retries
    #[error("remote call for {kind} '{resource}' failed after {attempts} attempt(s): {source}")]
    RemoteCallFailure {
        resource: String,
        kind: ResourceKind,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// Removal was attempted on a resource with live dependents attached.
    ///
    /// Ordering correctness is the teardown controller's core guarantee, so
    /// this is fatal and surfaced to the operator rather than worked around.
    #[error("{kind} '{resource}' still has dependents attached: {}", dependents.join(", "))]
    DependentResourceExists {
        resource: String,
        kind: ResourceKind,
        dependents: Vec<String>,
    },

    /// An output manifest entry named an attribute the converged stack does
    /// not expose. Indicates an apply-engine bug, not a user error.
    #[error("output '{key}' could not be resolved: '{resource}' has no attribute '{attribute}'")]
    OutputResolutionError {
        key: String,
        resource: String,
        attribute: String,
    },

    /// The external cancellation signal stopped the apply
    #[error("apply cancelled")]
    Cancelled,

    /// Parameter validation failed before any descriptor was produced
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

impl ProvisionError {
    /// Whether re-invoking apply can reasonably succeed without operator
    /// intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProvisionError::ConvergenceTimeout { .. } | ProvisionError::RemoteCallFailure { .. }
        )
    }

    /// The logical name of the resource involved, where one exists
    pub fn resource(&self) -> Option<&str> {
        match self {
            ProvisionError::UnresolvedReference { resource, .. }
            | ProvisionError::ConvergenceTimeout { resource, .. }
            | ProvisionError::RemoteCallFailure { resource, .. }
            | ProvisionError::DependentResourceExists { resource, .. }
            | ProvisionError::OutputResolutionError { resource, .. } => Some(resource),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_enumerates_offenders() {
        let err = ProvisionError::CycleDetected {
            cycle: vec!["JobQueue".into(), "SubmitJobsPolicy".into(), "JobQueue".into()],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle detected: JobQueue -> SubmitJobsPolicy -> JobQueue"
        );
        assert!(!err.is_retryable());
        assert!(err.resource().is_none());
    }

    #[test]
    fn convergence_timeout_is_retryable() {
        let err = ProvisionError::ConvergenceTimeout {
            resource: "ComputeEnvironment".into(),
            kind: ResourceKind::ComputeEnvironment,
            waited_secs: 120,
        };
        assert!(err.is_retryable());
        assert_eq!(err.resource(), Some("ComputeEnvironment"));
    }
}
