//! Stack parameters and derived physical names

use crate::error::ProvisionError;
use serde::{Deserialize, Serialize};

/// Default service name; also the prefix for every physical resource name
pub const DEFAULT_SERVICE_NAME: &str = "rios";
/// Default vCPUs requested per job
pub const DEFAULT_VCPUS: i64 = 1;
/// Default job memory in MB
pub const DEFAULT_MAX_MEMORY_MB: i64 = 4000;
/// Default ceiling for the auto-scaling compute environment
pub const DEFAULT_MAX_VCPUS: i64 = 128;
/// Default instance-type selector ("optimal" lets the scheduler pick)
pub const DEFAULT_INSTANCE_TYPE: &str = "optimal";
/// Default image tag referenced by the job definitions
pub const DEFAULT_IMAGE_TAG: &str = "latest";
/// Default expiry for untagged registry images, in days
pub const DEFAULT_UNTAGGED_RETENTION_DAYS: i64 = 1;
/// Default region for the stack
pub const DEFAULT_REGION: &str = "us-east-1";

/// Global parameters for one batch compute stack.
///
/// The service name doubles as the stack identity: every physical resource
/// name, lookup key, and output name is derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackParams {
    /// Service name, e.g. "rios"; prefix for all physical names
    pub service_name: String,
    /// vCPUs per job
    pub vcpus: i64,
    /// Job memory in MB
    pub max_memory_mb: i64,
    /// Upper bound for compute-environment scaling
    pub max_vcpus: i64,
    /// EC2 instance-type selector for the compute environment
    pub instance_type: String,
    /// Image tag the job definitions reference
    pub image_tag: String,
    /// Days until untagged registry images expire (tagged images never do)
    pub untagged_retention_days: i64,
    /// AWS region the stack lives in
    pub region: String,
}

impl Default for StackParams {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            vcpus: DEFAULT_VCPUS,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            max_vcpus: DEFAULT_MAX_VCPUS,
            instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            image_tag: DEFAULT_IMAGE_TAG.to_string(),
            untagged_retention_days: DEFAULT_UNTAGGED_RETENTION_DAYS,
            region: DEFAULT_REGION.to_string(),
        }
    }
}

impl StackParams {
    /// Validate the parameter set before any descriptor is produced
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.service_name.is_empty() {
            return Err(invalid("service_name", "cannot be empty"));
        }
        if !self
            .service_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(invalid(
                "service_name",
                "must be alphanumeric (with hyphens), it names remote resources",
            ));
        }
        if self.vcpus < 1 {
            return Err(invalid("vcpus", "must be at least 1"));
        }
        if self.max_memory_mb < 512 {
            return Err(invalid("max_memory_mb", "must be at least 512 MB"));
        }
        if self.max_vcpus < self.vcpus {
            return Err(invalid("max_vcpus", "must be >= vcpus"));
        }
        if self.instance_type.is_empty() {
            return Err(invalid("instance_type", "cannot be empty"));
        }
        if self.image_tag.is_empty() {
            return Err(invalid("image_tag", "cannot be empty"));
        }
        if self.untagged_retention_days < 1 {
            return Err(invalid("untagged_retention_days", "must be at least 1 day"));
        }
        if self.region.is_empty() {
            return Err(invalid("region", "cannot be empty"));
        }
        Ok(())
    }

    /// ECR repository name for the processing image (ECR requires lowercase)
    pub fn repository_name(&self) -> String {
        self.service_name.to_lowercase()
    }

    /// ECR repository name for the "main"-script image
    pub fn repository_main_name(&self) -> String {
        format!("{}main", self.service_name.to_lowercase())
    }

    /// Job queue physical name, e.g. "riosJobQueue"
    pub fn job_queue_name(&self) -> String {
        format!("{}JobQueue", self.service_name)
    }

    /// Processing job definition name, e.g. "riosJobDefinition"
    pub fn job_definition_name(&self) -> String {
        format!("{}JobDefinition", self.service_name)
    }

    /// "main" job definition name, e.g. "riosJobDefinitionMain"
    pub fn job_definition_main_name(&self) -> String {
        format!("{}JobDefinitionMain", self.service_name)
    }

    /// Compute environment physical name
    pub fn compute_environment_name(&self) -> String {
        format!("{}ComputeEnvironment", self.service_name)
    }
}

fn invalid(name: &'static str, reason: &str) -> ProvisionError {
    ProvisionError::InvalidParameter {
        name,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_documented() {
        let params = StackParams::default();
        params.validate().unwrap();
        assert_eq!(params.service_name, "rios");
        assert_eq!(params.vcpus, 1);
        assert_eq!(params.max_memory_mb, 4000);
        assert_eq!(params.max_vcpus, 128);
        assert_eq!(params.instance_type, "optimal");
        assert_eq!(params.image_tag, "latest");
        assert_eq!(params.untagged_retention_days, 1);
    }

    #[test]
    fn derived_names_follow_service_name() {
        let params = StackParams::default();
        assert_eq!(params.job_queue_name(), "riosJobQueue");
        assert_eq!(params.job_definition_name(), "riosJobDefinition");
        assert_eq!(params.job_definition_main_name(), "riosJobDefinitionMain");
        assert_eq!(params.repository_name(), "rios");
        assert_eq!(params.repository_main_name(), "riosmain");
    }

    #[test]
    fn rejects_bad_parameters() {
        let mut params = StackParams::default();
        params.vcpus = 0;
        assert!(params.validate().is_err());

        let mut params = StackParams::default();
        params.max_vcpus = 0;
        assert!(params.validate().is_err());

        let mut params = StackParams::default();
        params.service_name = "has spaces".into();
        assert!(params.validate().is_err());

        let mut params = StackParams::default();
        params.untagged_retention_days = 0;
        assert!(params.validate().is_err());
    }
}
