//! AWS Batch control plane
//!
//! Compute environment, job queue, and job definitions. Batch resources
//! have ordered teardown requirements of their own: an environment or queue
//! must be disabled and settle before deletion is accepted, which the store
//! sequences through these wrappers.

use crate::aws::context::AwsContext;
use crate::aws::error::sdk_error;
use anyhow::{Context, Result};
use aws_sdk_batch::types::{
    CeState, CeType, ComputeEnvironmentDetail, ComputeEnvironmentOrder, ComputeResource,
    ComputeResourceUpdate, ContainerProperties, CrType, JobDefinition, JobDefinitionType,
    JobQueueDetail, JqState, KeyValuePair, ResourceRequirement, ResourceType,
};
use aws_sdk_batch::Client;
use tracing::info;

pub struct BatchClient {
    client: Client,
}

/// Everything a managed EC2 compute environment needs
pub struct ComputeEnvironmentSpec<'a> {
    pub name: &'a str,
    pub min_vcpus: i32,
    pub max_vcpus: i32,
    pub instance_type: &'a str,
    pub subnets: Vec<String>,
    pub security_group: &'a str,
    pub placement_group: &'a str,
    pub instance_profile_arn: &'a str,
    pub service_role_arn: &'a str,
}

/// Container job definition parameters
pub struct JobDefinitionSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub vcpus: i64,
    pub memory_mb: i64,
    pub environment: Vec<(String, String)>,
}

impl BatchClient {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.batch_client(),
        }
    }

    pub async fn create_compute_environment(
        &self,
        spec: ComputeEnvironmentSpec<'_>,
    ) -> Result<String> {
        let resources = ComputeResource::builder()
            .r#type(CrType::Ec2)
            .minv_cpus(spec.min_vcpus)
            .maxv_cpus(spec.max_vcpus)
            .instance_types(spec.instance_type)
            .set_subnets(Some(spec.subnets))
            .security_group_ids(spec.security_group)
            .placement_group(spec.placement_group)
            .instance_role(spec.instance_profile_arn)
            .build()
            .context("invalid compute resource spec")?;

        let response = self
            .client
            .create_compute_environment()
            .compute_environment_name(spec.name)
            .r#type(CeType::Managed)
            .state(CeState::Enabled)
            .compute_resources(resources)
            .service_role(spec.service_role_arn)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create compute environment")?;
        let arn = response
            .compute_environment_arn()
            .context("CreateComputeEnvironment returned no ARN")?
            .to_string();
        info!(name = spec.name, arn, "compute environment created");
        Ok(arn)
    }

    pub async fn describe_compute_environment(
        &self,
        name: &str,
    ) -> Result<Option<ComputeEnvironmentDetail>> {
        let response = self
            .client
            .describe_compute_environments()
            .compute_environments(name)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe compute environment")?;
        Ok(response.compute_environments().first().cloned())
    }

    /// Resize the vCPU envelope. Only the capacity bounds are mutable on a
    /// managed EC2 environment; anything else forces recreation.
    pub async fn update_compute_environment_capacity(
        &self,
        name: &str,
        min_vcpus: i32,
        max_vcpus: i32,
    ) -> Result<()> {
        self.client
            .update_compute_environment()
            .compute_environment(name)
            .compute_resources(
                ComputeResourceUpdate::builder()
                    .minv_cpus(min_vcpus)
                    .maxv_cpus(max_vcpus)
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to update compute environment")?;
        info!(name, min_vcpus, max_vcpus, "compute environment updated");
        Ok(())
    }

    pub async fn disable_compute_environment(&self, name: &str) -> Result<()> {
        self.client
            .update_compute_environment()
            .compute_environment(name)
            .state(CeState::Disabled)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to disable compute environment")?;
        Ok(())
    }

    pub async fn delete_compute_environment(&self, name: &str) -> Result<()> {
        self.client
            .delete_compute_environment()
            .compute_environment(name)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete compute environment")?;
        info!(name, "compute environment deleted");
        Ok(())
    }

    pub async fn create_job_queue(
        &self,
        name: &str,
        priority: i32,
        compute_environment_arn: &str,
    ) -> Result<String> {
        let order = ComputeEnvironmentOrder::builder()
            .order(1)
            .compute_environment(compute_environment_arn)
            .build()
            .context("invalid compute environment order")?;

        let response = self
            .client
            .create_job_queue()
            .job_queue_name(name)
            .state(JqState::Enabled)
            .priority(priority)
            .compute_environment_order(order)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create job queue")?;
        let arn = response
            .job_queue_arn()
            .context("CreateJobQueue returned no ARN")?
            .to_string();
        info!(name, arn, "job queue created");
        Ok(arn)
    }

    pub async fn update_job_queue(
        &self,
        name: &str,
        priority: i32,
        compute_environment_arn: &str,
    ) -> Result<()> {
        let order = ComputeEnvironmentOrder::builder()
            .order(1)
            .compute_environment(compute_environment_arn)
            .build()
            .context("invalid compute environment order")?;

        self.client
            .update_job_queue()
            .job_queue(name)
            .priority(priority)
            .compute_environment_order(order)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to update job queue")?;
        info!(name, priority, "job queue updated");
        Ok(())
    }

    pub async fn describe_job_queue(&self, name: &str) -> Result<Option<JobQueueDetail>> {
        let response = self
            .client
            .describe_job_queues()
            .job_queues(name)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe job queue")?;
        Ok(response.job_queues().first().cloned())
    }

    pub async fn disable_job_queue(&self, name: &str) -> Result<()> {
        self.client
            .update_job_queue()
            .job_queue(name)
            .state(JqState::Disabled)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to disable job queue")?;
        Ok(())
    }

    pub async fn delete_job_queue(&self, name: &str) -> Result<()> {
        self.client
            .delete_job_queue()
            .job_queue(name)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete job queue")?;
        info!(name, "job queue deleted");
        Ok(())
    }

    pub async fn register_job_definition(&self, spec: JobDefinitionSpec<'_>) -> Result<String> {
        let mut container = ContainerProperties::builder()
            .image(spec.image)
            .resource_requirements(
                ResourceRequirement::builder()
                    .r#type(ResourceType::Vcpu)
                    .value(spec.vcpus.to_string())
                    .build()
                    .context("invalid vcpu requirement")?,
            )
            .resource_requirements(
                ResourceRequirement::builder()
                    .r#type(ResourceType::Memory)
                    .value(spec.memory_mb.to_string())
                    .build()
                    .context("invalid memory requirement")?,
            );
        for (name, value) in spec.environment {
            container = container
                .environment(KeyValuePair::builder().name(name).value(value).build());
        }

        let response = self
            .client
            .register_job_definition()
            .job_definition_name(spec.name)
            .r#type(JobDefinitionType::Container)
            .container_properties(container.build())
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to register job definition")?;
        let arn = response
            .job_definition_arn()
            .context("RegisterJobDefinition returned no ARN")?
            .to_string();
        info!(name = spec.name, arn, "job definition registered");
        Ok(arn)
    }

    /// The latest active revision registered under `name`
    pub async fn describe_job_definition(&self, name: &str) -> Result<Option<JobDefinition>> {
        let response = self
            .client
            .describe_job_definitions()
            .job_definition_name(name)
            .status("ACTIVE")
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe job definitions")?;
        Ok(response
            .job_definitions()
            .iter()
            .max_by_key(|d| d.revision())
            .cloned())
    }

    pub async fn deregister_job_definition(&self, arn: &str) -> Result<()> {
        self.client
            .deregister_job_definition()
            .job_definition(arn)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to deregister job definition")?;
        info!(arn, "job definition deregistered");
        Ok(())
    }
}
