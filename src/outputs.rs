//! Output manifest
//!
//! After convergence, a fixed manifest maps output keys to attributes of
//! named resources. Downstream job submitters look up the queue and job
//! definitions by these keys, so the set and its names are part of the
//! stack's public contract.

use crate::error::ProvisionError;
use crate::params::StackParams;
use crate::reconciler::AttributeStore;
use crate::descriptor::attr;
use serde::Serialize;
use std::collections::BTreeMap;

/// One manifest entry: output key, source resource, source attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    pub key: &'static str,
    pub logical_name: &'static str,
    pub attribute: &'static str,
}

/// The attribute-backed outputs every converged stack exposes
pub fn manifest() -> &'static [OutputSpec] {
    const MANIFEST: &[OutputSpec] = &[
        OutputSpec {
            key: "VpcId",
            logical_name: "Vpc",
            attribute: attr::ID,
        },
        OutputSpec {
            key: "ComputeEnvironmentArn",
            logical_name: "ComputeEnvironment",
            attribute: attr::ARN,
        },
        OutputSpec {
            key: "JobQueueArn",
            logical_name: "JobQueue",
            attribute: attr::ARN,
        },
        OutputSpec {
            key: "JobQueueName",
            logical_name: "JobQueue",
            attribute: attr::NAME,
        },
        OutputSpec {
            key: "JobDefinitionArn",
            logical_name: "JobDefinition",
            attribute: attr::ARN,
        },
        OutputSpec {
            key: "JobDefinitionName",
            logical_name: "JobDefinition",
            attribute: attr::NAME,
        },
        OutputSpec {
            key: "JobDefinitionMainArn",
            logical_name: "JobDefinitionMain",
            attribute: attr::ARN,
        },
        OutputSpec {
            key: "JobDefinitionMainName",
            logical_name: "JobDefinitionMain",
            attribute: attr::NAME,
        },
        OutputSpec {
            key: "RepositoryUri",
            logical_name: "Repository",
            attribute: attr::URI,
        },
        OutputSpec {
            key: "RepositoryUriMain",
            logical_name: "RepositoryMain",
            attribute: attr::URI,
        },
    ];
    MANIFEST
}

/// Resolved outputs, sorted by key for stable serialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StackOutputs(BTreeMap<String, String>);

impl StackOutputs {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Resolve the manifest against the attributes a converged apply recorded,
/// plus the parameter echoes job submitters size their requests with.
pub fn resolve(
    params: &StackParams,
    attributes: &AttributeStore,
) -> Result<StackOutputs, ProvisionError> {
    let mut outputs = BTreeMap::new();

    for spec in manifest() {
        let value = attributes
            .attribute(spec.logical_name, spec.attribute)
            .ok_or_else(|| ProvisionError::OutputResolutionError {
                key: spec.key.to_string(),
                resource: spec.logical_name.to_string(),
                attribute: spec.attribute.to_string(),
            })?;
        outputs.insert(spec.key.to_string(), value.to_string());
    }

    outputs.insert("Vcpus".to_string(), params.vcpus.to_string());
    outputs.insert("MaxVcpus".to_string(), params.max_vcpus.to_string());

    Ok(StackOutputs(outputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ResourceKind;
    use crate::store::{LiveResource, ResolvedResource, ResolvedValue, ResourceStore};
    use crate::store::memory::MemoryStore;

    async fn fabricate(store: &MemoryStore, name: &str, kind: ResourceKind) -> LiveResource {
        store
            .create(
                "rios",
                &ResolvedResource {
                    logical_name: name.to_string(),
                    kind,
                    properties: vec![(
                        "name".to_string(),
                        ResolvedValue::Str(name.to_string()),
                    )],
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn resolves_the_full_manifest() {
        let store = MemoryStore::new();
        let mut attrs = AttributeStore::default();
        for spec in manifest() {
            let kind = match spec.logical_name {
                "Vpc" => ResourceKind::Vpc,
                "ComputeEnvironment" => ResourceKind::ComputeEnvironment,
                "JobQueue" => ResourceKind::JobQueue,
                "JobDefinition" | "JobDefinitionMain" => ResourceKind::JobDefinition,
                _ => ResourceKind::Repository,
            };
            if attrs.get(spec.logical_name).is_none() {
                let live = fabricate(&store, spec.logical_name, kind).await;
                attrs.record(spec.logical_name, live);
            }
        }

        let outputs = resolve(&StackParams::default(), &attrs).unwrap();
        assert_eq!(outputs.len(), manifest().len() + 2);
        assert_eq!(outputs.get("Vcpus"), Some("1"));
        assert_eq!(outputs.get("MaxVcpus"), Some("128"));
        assert!(outputs.get("VpcId").unwrap().starts_with("vpc-"));
        assert!(outputs
            .get("RepositoryUri")
            .unwrap()
            .ends_with(".amazonaws.com/Repository"));
    }

    #[tokio::test]
    async fn missing_attribute_is_a_resolution_error() {
        let attrs = AttributeStore::default();
        let err = resolve(&StackParams::default(), &attrs).unwrap_err();
        match err {
            ProvisionError::OutputResolutionError { key, resource, .. } => {
                assert_eq!(key, "VpcId");
                assert_eq!(resource, "Vpc");
            }
            other => panic!("expected OutputResolutionError, got {other}"),
        }
    }
}
