//! The fixed RIOS batch stack topology
//!
//! `stack_descriptors` expands a parameter set into the full declarative
//! resource graph: network, security boundary, image registries, IAM trust
//! chain, placement-aware compute environment, job queue, and the two job
//! definitions. Two deliberate cycle-breaking workarounds from the source
//! design are kept explicit here:
//!
//! - the security group's self-referential ingress rule is its own
//!   descriptor, so the group does not reference itself;
//! - the job-submission policy grants `batch:SubmitJob` on wildcard
//!   queue/definition ARNs instead of referencing the queue it effectively
//!   targets, which would otherwise close a cycle through the IAM chain.

use crate::descriptor::{attr, PropertyValue, ResourceDescriptor, ResourceKind};
use crate::params::StackParams;

/// VPC CIDR; each subnet takes a /20 slice
const VPC_CIDR: &str = "10.0.0.0/16";
const SUBNET_CIDRS: [&str; 3] = ["10.0.0.0/20", "10.0.16.0/20", "10.0.32.0/20"];
/// Port range jobs use for inter-node communication
const JOB_PORT_RANGE: (i64, i64) = (30_000, 50_000);

/// Managed policy granting the batch control plane its service permissions
const BATCH_SERVICE_POLICY_ARN: &str =
    "arn:aws:iam::aws:policy/service-role/AWSBatchServiceRole";
/// Managed policies attached to the instance role: container agent, object
/// storage, monitoring, and template introspection
const INSTANCE_POLICY_ARNS: [&str; 4] = [
    "arn:aws:iam::aws:policy/service-role/AmazonEC2ContainerServiceforEC2Role",
    "arn:aws:iam::aws:policy/AmazonS3FullAccess",
    "arn:aws:iam::aws:policy/CloudWatchLogsFullAccess",
    "arn:aws:iam::aws:policy/AWSCloudFormationReadOnlyAccess",
];

/// Environment variables injected into the "main" job definition so a running
/// main job can introspect the stack and submit sibling jobs
pub const ENV_STACK: &str = "RIOS_BATCH_STACK";
pub const ENV_REGION: &str = "RIOS_BATCH_REGION";

/// Produce the full descriptor set for one stack, in declaration order.
///
/// Declaration order is the deterministic tie-break for independent
/// subgraphs, so it is part of the contract: identical parameters always
/// yield an identical, diff-friendly apply order.
pub fn stack_descriptors(params: &StackParams) -> Vec<ResourceDescriptor> {
    let mut descriptors = vec![ResourceDescriptor::new("Vpc", ResourceKind::Vpc)
        .with("cidr", VPC_CIDR)
        .with("dns_support", true)];

    // One public subnet per availability zone
    for (i, suffix) in ["A", "B", "C"].iter().enumerate() {
        descriptors.push(
            ResourceDescriptor::new(format!("Subnet{suffix}"), ResourceKind::Subnet)
                .with("vpc", PropertyValue::reference("Vpc", attr::ID))
                .with("cidr", SUBNET_CIDRS[i])
                .with("az_index", i as i64)
                .with("public", true),
        );
    }

    descriptors.push(
        ResourceDescriptor::new("SecurityGroup", ResourceKind::SecurityGroup)
            .with("vpc", PropertyValue::reference("Vpc", attr::ID))
            .with(
                "description",
                format!("{} batch inter-node traffic", params.service_name),
            ),
    );
    // Self-referential rule kept as a separate descriptor to avoid a self-edge
    descriptors.push(
        ResourceDescriptor::new("SelfIngress", ResourceKind::SecurityGroupIngress)
            .with("group", PropertyValue::reference("SecurityGroup", attr::ID))
            .with(
                "source_group",
                PropertyValue::reference("SecurityGroup", attr::ID),
            )
            .with("protocol", "tcp")
            .with("from_port", JOB_PORT_RANGE.0)
            .with("to_port", JOB_PORT_RANGE.1),
    );

    // Outbound internet access plus a zero-cost path to object storage
    descriptors.push(ResourceDescriptor::new(
        "InternetGateway",
        ResourceKind::InternetGateway,
    ));
    descriptors.push(
        ResourceDescriptor::new("GatewayAttachment", ResourceKind::GatewayAttachment)
            .with("vpc", PropertyValue::reference("Vpc", attr::ID))
            .with(
                "gateway",
                PropertyValue::reference("InternetGateway", attr::ID),
            ),
    );
    descriptors.push(
        ResourceDescriptor::new("RouteTable", ResourceKind::RouteTable)
            .with("vpc", PropertyValue::reference("Vpc", attr::ID)),
    );
    descriptors.push(
        ResourceDescriptor::new("DefaultRoute", ResourceKind::Route)
            .with("route_table", PropertyValue::reference("RouteTable", attr::ID))
            .with(
                "gateway",
                PropertyValue::reference("InternetGateway", attr::ID),
            )
            // The route is useless until the gateway is attached
            .with(
                "attachment",
                PropertyValue::reference("GatewayAttachment", attr::ID),
            )
            .with("destination", "0.0.0.0/0"),
    );
    for suffix in ["A", "B", "C"] {
        descriptors.push(
            ResourceDescriptor::new(
                format!("Subnet{suffix}RouteAssoc"),
                ResourceKind::SubnetRouteTableAssociation,
            )
            .with(
                "subnet",
                PropertyValue::reference(format!("Subnet{suffix}"), attr::ID),
            )
            .with("route_table", PropertyValue::reference("RouteTable", attr::ID)),
        );
    }
    descriptors.push(
        ResourceDescriptor::new("StorageEndpoint", ResourceKind::VpcEndpoint)
            .with("vpc", PropertyValue::reference("Vpc", attr::ID))
            .with("route_table", PropertyValue::reference("RouteTable", attr::ID))
            .with("service", "s3"),
    );

    // Image registries with an untagged-expiry retention rule
    descriptors.push(
        ResourceDescriptor::new("Repository", ResourceKind::Repository)
            .with("name", params.repository_name())
            .with("untagged_retention_days", params.untagged_retention_days),
    );
    descriptors.push(
        ResourceDescriptor::new("RepositoryMain", ResourceKind::Repository)
            .with("name", params.repository_main_name())
            .with("untagged_retention_days", params.untagged_retention_days),
    );

    // IAM trust chain
    descriptors.push(
        ResourceDescriptor::new("BatchServiceRole", ResourceKind::Role)
            .with("name", format!("{}BatchServiceRole", params.service_name))
            .with("trusted_service", "batch.amazonaws.com")
            .with(
                "managed_policies",
                PropertyValue::List(vec![BATCH_SERVICE_POLICY_ARN.into()]),
            ),
    );
    descriptors.push(
        ResourceDescriptor::new("SubmitJobsPolicy", ResourceKind::ManagedPolicy)
            .with("name", format!("{}SubmitJobs", params.service_name))
            .with("document", submit_jobs_policy_document()),
    );
    descriptors.push(
        ResourceDescriptor::new("InstanceRole", ResourceKind::Role)
            .with("name", format!("{}InstanceRole", params.service_name))
            .with("trusted_service", "ec2.amazonaws.com")
            .with(
                "managed_policies",
                PropertyValue::List(
                    INSTANCE_POLICY_ARNS
                        .iter()
                        .map(|arn| PropertyValue::Str((*arn).to_string()))
                        .chain(std::iter::once(PropertyValue::reference(
                            "SubmitJobsPolicy",
                            attr::ARN,
                        )))
                        .collect(),
                ),
            ),
    );
    descriptors.push(
        ResourceDescriptor::new("InstanceProfile", ResourceKind::InstanceProfile)
            .with("name", format!("{}InstanceProfile", params.service_name))
            .with("role", PropertyValue::reference("InstanceRole", attr::NAME)),
    );

    // Cluster placement keeps inter-node latency low for multi-node jobs
    descriptors.push(
        ResourceDescriptor::new("PlacementGroup", ResourceKind::PlacementGroup)
            .with("name", format!("{}Placement", params.service_name))
            .with("strategy", "cluster"),
    );

    descriptors.push(
        ResourceDescriptor::new("ComputeEnvironment", ResourceKind::ComputeEnvironment)
            .with("name", params.compute_environment_name())
            .with("min_vcpus", 0)
            .with("max_vcpus", params.max_vcpus)
            .with("instance_type", params.instance_type.as_str())
            .with(
                "subnets",
                PropertyValue::List(vec![
                    PropertyValue::reference("SubnetA", attr::ID),
                    PropertyValue::reference("SubnetB", attr::ID),
                    PropertyValue::reference("SubnetC", attr::ID),
                ]),
            )
            .with(
                "security_group",
                PropertyValue::reference("SecurityGroup", attr::ID),
            )
            .with(
                "placement_group",
                PropertyValue::reference("PlacementGroup", attr::NAME),
            )
            .with(
                "instance_profile",
                PropertyValue::reference("InstanceProfile", attr::ARN),
            )
            .with(
                "service_role",
                PropertyValue::reference("BatchServiceRole", attr::ARN),
            ),
    );

    descriptors.push(
        ResourceDescriptor::new("JobQueue", ResourceKind::JobQueue)
            .with("name", params.job_queue_name())
            .with("priority", 1)
            .with(
                "compute_environment",
                PropertyValue::reference("ComputeEnvironment", attr::ARN),
            ),
    );

    descriptors.push(
        ResourceDescriptor::new("JobDefinition", ResourceKind::JobDefinition)
            .with("name", params.job_definition_name())
            .with("image", PropertyValue::reference("Repository", attr::URI))
            .with("image_tag", params.image_tag.as_str())
            .with("vcpus", params.vcpus)
            .with("memory_mb", params.max_memory_mb),
    );
    descriptors.push(
        ResourceDescriptor::new("JobDefinitionMain", ResourceKind::JobDefinition)
            .with("name", params.job_definition_main_name())
            .with("image", PropertyValue::reference("RepositoryMain", attr::URI))
            .with("image_tag", params.image_tag.as_str())
            .with("vcpus", params.vcpus)
            .with("memory_mb", params.max_memory_mb)
            // Lets the main job discover its own stack and submit siblings
            .with("env_stack_var", ENV_STACK)
            .with("env_stack_value", params.service_name.as_str())
            .with("env_region_var", ENV_REGION)
            .with("env_region_value", params.region.as_str()),
    );

    descriptors
}

/// Job-submission policy scoped by wildcard instead of exact queue ARN.
///
/// Referencing the queue here would close a reference cycle (queue → compute
/// environment → instance role → policy → queue), so the grant covers any
/// queue and definition in-account. A documented trade-off in the source
/// design, not a bug.
fn submit_jobs_policy_document() -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Sid": "SubmitJobs",
                "Effect": "Allow",
                "Action": [
                    "batch:SubmitJob",
                    "batch:DescribeJobs",
                    "batch:DescribeJobQueues",
                    "batch:DescribeJobDefinitions"
                ],
                "Resource": [
                    "arn:aws:batch:*:*:job-queue/*",
                    "arn:aws:batch:*:*:job-definition/*"
                ]
            }
        ]
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_set_is_complete_and_uniquely_named() {
        let descriptors = stack_descriptors(&StackParams::default());

        let mut names: Vec<&str> = descriptors.iter().map(|d| d.logical_name.as_str()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total, "logical names must be unique");

        let count = |kind: ResourceKind| descriptors.iter().filter(|d| d.kind == kind).count();
        assert_eq!(count(ResourceKind::Vpc), 1);
        assert_eq!(count(ResourceKind::Subnet), 3);
        assert_eq!(count(ResourceKind::Repository), 2);
        assert_eq!(count(ResourceKind::Role), 2);
        assert_eq!(count(ResourceKind::JobDefinition), 2);
        assert_eq!(count(ResourceKind::ComputeEnvironment), 1);
        assert_eq!(count(ResourceKind::JobQueue), 1);
        assert_eq!(count(ResourceKind::PlacementGroup), 1);
    }

    #[test]
    fn submit_policy_has_no_queue_reference() {
        let descriptors = stack_descriptors(&StackParams::default());
        let policy = descriptors
            .iter()
            .find(|d| d.logical_name == "SubmitJobsPolicy")
            .unwrap();
        assert!(policy.references().is_empty());

        let doc = match policy.property("document").unwrap() {
            PropertyValue::Str(s) => s,
            other => panic!("unexpected document value: {other:?}"),
        };
        let parsed: serde_json::Value = serde_json::from_str(doc).unwrap();
        let resources = parsed["Statement"][0]["Resource"].as_array().unwrap();
        assert!(resources
            .iter()
            .all(|r| r.as_str().unwrap().contains(":*:job-")));
    }

    #[test]
    fn self_ingress_references_group_twice_but_group_references_nothing_back() {
        let descriptors = stack_descriptors(&StackParams::default());
        let ingress = descriptors
            .iter()
            .find(|d| d.logical_name == "SelfIngress")
            .unwrap();
        let targets: Vec<&str> = ingress.references().iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["SecurityGroup", "SecurityGroup"]);

        let group = descriptors
            .iter()
            .find(|d| d.logical_name == "SecurityGroup")
            .unwrap();
        assert!(group.references().iter().all(|r| r.target == "Vpc"));
    }

    #[test]
    fn main_definition_carries_stack_identity_env() {
        let descriptors = stack_descriptors(&StackParams::default());
        let main = descriptors
            .iter()
            .find(|d| d.logical_name == "JobDefinitionMain")
            .unwrap();
        assert_eq!(
            main.property("env_stack_value"),
            Some(&PropertyValue::Str("rios".into()))
        );
        assert_eq!(
            main.property("env_region_var"),
            Some(&PropertyValue::Str(ENV_REGION.into()))
        );
    }
}
