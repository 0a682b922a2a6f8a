//! The remote resource store seam
//!
//! The cloud provider is modelled as a transactional resource store reachable
//! over authenticated calls: create, describe/poll, update, delete, each
//! idempotent by stack identity plus logical name. `aws::AwsStore` is the
//! live implementation; `store::memory::MemoryStore` is the deterministic
//! in-process one used by the engine tests.

pub mod memory;

use crate::descriptor::{PropertyValue, ResourceDescriptor, ResourceKind};
use crate::error::ProvisionError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

/// A property value with every reference substituted
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<ResolvedValue>),
}

impl ResolvedValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ResolvedValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ResolvedValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Flatten a list value into its string items
    pub fn as_str_list(&self) -> Option<Vec<&str>> {
        match self {
            ResolvedValue::List(items) => items.iter().map(ResolvedValue::as_str).collect(),
            _ => None,
        }
    }
}

/// A descriptor ready to be sent to the remote store: same identity and
/// property order, references replaced with the attributes their targets
/// produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResource {
    pub logical_name: String,
    pub kind: ResourceKind,
    pub properties: Vec<(String, ResolvedValue)>,
}

impl ResolvedResource {
    pub fn property(&self, key: &str) -> Option<&ResolvedValue> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Required string property; missing means the template and store
    /// disagree about this kind's schema.
    pub fn str_property(&self, key: &str) -> Result<&str, StoreError> {
        self.property(key)
            .and_then(ResolvedValue::as_str)
            .ok_or_else(|| {
                StoreError::Rejected(format!(
                    "{} '{}' is missing string property '{key}'",
                    self.kind, self.logical_name
                ))
            })
    }

    pub fn int_property(&self, key: &str) -> Result<i64, StoreError> {
        self.property(key)
            .and_then(ResolvedValue::as_int)
            .ok_or_else(|| {
                StoreError::Rejected(format!(
                    "{} '{}' is missing integer property '{key}'",
                    self.kind, self.logical_name
                ))
            })
    }
}

/// Substitute every reference in `descriptor` using `lookup`, which maps
/// (target logical name, attribute) to an already-recorded attribute value.
pub fn resolve_descriptor<F>(
    descriptor: &ResourceDescriptor,
    lookup: F,
) -> Result<ResolvedResource, ProvisionError>
where
    F: Fn(&str, &str) -> Option<String>,
{
    fn resolve_value<F>(
        resource: &str,
        value: &PropertyValue,
        lookup: &F,
    ) -> Result<ResolvedValue, ProvisionError>
    where
        F: Fn(&str, &str) -> Option<String>,
    {
        match value {
            PropertyValue::Str(s) => Ok(ResolvedValue::Str(s.clone())),
            PropertyValue::Int(i) => Ok(ResolvedValue::Int(*i)),
            PropertyValue::Bool(b) => Ok(ResolvedValue::Bool(*b)),
            PropertyValue::List(items) => Ok(ResolvedValue::List(
                items
                    .iter()
                    .map(|item| resolve_value(resource, item, lookup))
                    .collect::<Result<_, _>>()?,
            )),
            PropertyValue::Ref(reference) => lookup(&reference.target, reference.attribute)
                .map(ResolvedValue::Str)
                .ok_or_else(|| ProvisionError::UnresolvedReference {
                    resource: resource.to_string(),
                    target: reference.target.clone(),
                    attribute: reference.attribute.to_string(),
                }),
        }
    }

    let properties = descriptor
        .properties
        .iter()
        .map(|(key, value)| {
            resolve_value(&descriptor.logical_name, value, &lookup).map(|v| (key.clone(), v))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ResolvedResource {
        logical_name: descriptor.logical_name.clone(),
        kind: descriptor.kind,
        properties,
    })
}

/// The remote-side record created from a descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct LiveResource {
    /// Provider-assigned identifier
    pub remote_id: String,
    /// Attributes exposed to dependents ("id", "arn", "name", "uri", ...)
    pub attributes: BTreeMap<String, String>,
    /// Properties as last applied, for drift detection
    pub properties: Vec<(String, ResolvedValue)>,
    pub created_at: DateTime<Utc>,
}

impl LiveResource {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Remote readiness as observed by a describe/poll call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteHealth {
    /// Still converging towards ready
    Creating,
    /// Stable and usable by dependents
    Ready,
    /// No longer present (the target state for deletion polls)
    Gone,
    /// The provider gave up on this resource
    Failed(String),
}

/// Errors produced by a resource store implementation
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced remote resource does not exist
    #[error("resource not found")]
    NotFound,

    /// Deletion refused because live dependents are still attached
    #[error("dependent resources still attached: {}", dependents.join(", "))]
    DependentResourceExists { dependents: Vec<String> },

    /// Transient network or API failure; safe to retry with backoff
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The provider rejected the request outright; retrying won't help
    #[error("remote call rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// A remote transactional resource store.
///
/// Implementations must key every operation on stack identity plus logical
/// name so that re-running apply never duplicates resources.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Find the live resource previously created for this stack + logical
    /// name, if any. This is the idempotency lookup.
    async fn lookup(
        &self,
        stack: &str,
        logical_name: &str,
        kind: ResourceKind,
    ) -> Result<Option<LiveResource>, StoreError>;

    /// Create the resource. Must be idempotent: if an earlier interrupted
    /// apply already created it, return the existing record.
    async fn create(
        &self,
        stack: &str,
        resource: &ResolvedResource,
    ) -> Result<LiveResource, StoreError>;

    /// Mutate an existing resource in place towards the desired properties
    async fn update(
        &self,
        stack: &str,
        live: &LiveResource,
        resource: &ResolvedResource,
    ) -> Result<LiveResource, StoreError>;

    /// Observe current readiness of a live resource
    async fn health(
        &self,
        stack: &str,
        kind: ResourceKind,
        remote_id: &str,
    ) -> Result<RemoteHealth, StoreError>;

    /// Remove a live resource. Must fail with `DependentResourceExists`
    /// rather than attempt partial deletion when dependents remain.
    async fn delete(
        &self,
        stack: &str,
        kind: ResourceKind,
        remote_id: &str,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::attr;

    #[test]
    fn resolve_substitutes_nested_references() {
        let desc = ResourceDescriptor::new("ComputeEnvironment", ResourceKind::ComputeEnvironment)
            .with("max_vcpus", 128)
            .with(
                "subnets",
                PropertyValue::List(vec![
                    PropertyValue::reference("SubnetA", attr::ID),
                    PropertyValue::reference("SubnetB", attr::ID),
                ]),
            );

        let resolved = resolve_descriptor(&desc, |target, attribute| {
            assert_eq!(attribute, attr::ID);
            Some(format!("subnet-{}", target.to_lowercase()))
        })
        .unwrap();

        assert_eq!(resolved.int_property("max_vcpus").unwrap(), 128);
        assert_eq!(
            resolved.property("subnets").unwrap().as_str_list().unwrap(),
            vec!["subnet-subneta", "subnet-subnetb"]
        );
    }

    #[test]
    fn resolve_fails_as_unresolved_reference() {
        let desc = ResourceDescriptor::new("JobQueue", ResourceKind::JobQueue).with(
            "compute_environment",
            PropertyValue::reference("ComputeEnvironment", attr::ARN),
        );

        let err = resolve_descriptor(&desc, |_, _| None).unwrap_err();
        match err {
            ProvisionError::UnresolvedReference {
                resource, target, ..
            } => {
                assert_eq!(resource, "JobQueue");
                assert_eq!(target, "ComputeEnvironment");
            }
            other => panic!("expected UnresolvedReference, got {other}"),
        }
    }
}
