//! The live `ResourceStore` backed by AWS
//!
//! Dispatches each resource kind to the right service wrapper and maps SDK
//! failures into the engine's store errors. Idempotency works two ways:
//! taggable EC2 resources are found by the stack/logical tags, everything
//! else is addressed by its deterministic physical name derived from the
//! stack parameters. Sub-resources without ids of their own (gateway
//! attachment, route, ingress rule) use composite remote ids.

use crate::aws::batch::{BatchClient, ComputeEnvironmentSpec, JobDefinitionSpec};
use crate::aws::context::AwsContext;
use crate::aws::ec2::Ec2Client;
use crate::aws::ecr::EcrClient;
use crate::aws::error::to_store_error;
use crate::aws::iam::IamClient;
use crate::descriptor::{attr, ResourceKind};
use crate::params::StackParams;
use crate::store::{
    LiveResource, RemoteHealth, ResolvedResource, ResolvedValue, ResourceStore, StoreError,
};
use crate::template::{ENV_REGION, ENV_STACK};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Rounds of the disable-then-delete settle loop for Batch resources
const BATCH_DISABLE_POLLS: usize = 20;
const BATCH_DISABLE_DELAY: Duration = Duration::from_secs(3);

pub struct AwsStore {
    ctx: AwsContext,
    ec2: Ec2Client,
    ecr: EcrClient,
    iam: IamClient,
    batch: BatchClient,
    params: StackParams,
}

fn live(
    remote_id: String,
    attributes: Vec<(&str, String)>,
    properties: Vec<(String, ResolvedValue)>,
) -> LiveResource {
    LiveResource {
        remote_id,
        attributes: attributes
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<_, _>>(),
        properties,
        created_at: Utc::now(),
    }
}

fn s(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

fn str_prop(key: &str, value: &str) -> (String, ResolvedValue) {
    (key.to_string(), ResolvedValue::Str(value.to_string()))
}

fn int_prop(key: &str, value: i64) -> (String, ResolvedValue) {
    (key.to_string(), ResolvedValue::Int(value))
}

fn int32(resource: &ResolvedResource, key: &str) -> Result<i32, StoreError> {
    let value = resource.int_property(key)?;
    i32::try_from(value)
        .map_err(|_| StoreError::Rejected(format!("property '{key}' out of range: {value}")))
}

fn str_list(resource: &ResolvedResource, key: &str) -> Result<Vec<String>, StoreError> {
    resource
        .property(key)
        .and_then(ResolvedValue::as_str_list)
        .map(|items| items.into_iter().map(str::to_string).collect())
        .ok_or_else(|| {
            StoreError::Rejected(format!(
                "'{}' is missing list property '{key}'",
                resource.logical_name
            ))
        })
}

/// Trust documents come back URL-encoded; the service principal substring
/// survives encoding, which is all reconstruction needs.
fn sniff_trusted_service(document: &str) -> String {
    for service in ["batch.amazonaws.com", "ec2.amazonaws.com"] {
        if document.contains(service) {
            return service.to_string();
        }
    }
    String::new()
}

impl AwsStore {
    /// Load AWS configuration and resolve the caller identity
    pub async fn connect(params: StackParams) -> Result<Self> {
        let ctx = AwsContext::new(&params.region).await?;
        Ok(Self {
            ec2: Ec2Client::from_context(&ctx),
            ecr: EcrClient::from_context(&ctx),
            iam: IamClient::from_context(&ctx),
            batch: BatchClient::from_context(&ctx),
            ctx,
            params,
        })
    }

    /// Physical name for kinds addressed by name instead of tags.
    ///
    /// Mirrors the naming in the stack template; these two must agree for
    /// lookups to find what apply created.
    fn physical_name(&self, logical: &str) -> Option<String> {
        let svc = &self.params.service_name;
        Some(match logical {
            "Repository" => self.params.repository_name(),
            "RepositoryMain" => self.params.repository_main_name(),
            "BatchServiceRole" => format!("{svc}BatchServiceRole"),
            "SubmitJobsPolicy" => format!("{svc}SubmitJobs"),
            "InstanceRole" => format!("{svc}InstanceRole"),
            "InstanceProfile" => format!("{svc}InstanceProfile"),
            "PlacementGroup" => format!("{svc}Placement"),
            "ComputeEnvironment" => self.params.compute_environment_name(),
            "JobQueue" => self.params.job_queue_name(),
            "JobDefinition" => self.params.job_definition_name(),
            "JobDefinitionMain" => self.params.job_definition_main_name(),
            _ => return None,
        })
    }

    fn named(&self, logical: &str) -> Result<String, StoreError> {
        self.physical_name(logical).ok_or_else(|| {
            StoreError::Rejected(format!("no physical name mapping for '{logical}'"))
        })
    }

    fn policy_arn(&self, name: &str) -> String {
        format!(
            "arn:aws:iam::{}:policy/{name}",
            self.ctx.account_id()
        )
    }

    async fn zone_index(&self, zone: &str) -> Result<i64, StoreError> {
        let names = self
            .ec2
            .availability_zone_names()
            .await
            .map_err(to_store_error)?;
        names
            .iter()
            .position(|n| n == zone)
            .map(|i| i as i64)
            .ok_or_else(|| StoreError::Rejected(format!("unknown availability zone '{zone}'")))
    }

    /// Batch resources must be disabled and settled before deletion
    async fn remove_compute_environment(&self, name: &str) -> Result<(), StoreError> {
        self.batch
            .disable_compute_environment(name)
            .await
            .map_err(to_store_error)?;
        for _ in 0..BATCH_DISABLE_POLLS {
            match self
                .batch
                .describe_compute_environment(name)
                .await
                .map_err(to_store_error)?
            {
                None => return Ok(()),
                Some(detail) => {
                    let status = detail.status().map(|st| st.as_str());
                    let state = detail.state().map(|st| st.as_str());
                    if state == Some("DISABLED") && status != Some("UPDATING") {
                        break;
                    }
                }
            }
            tokio::time::sleep(BATCH_DISABLE_DELAY).await;
        }
        self.batch
            .delete_compute_environment(name)
            .await
            .map_err(to_store_error)
    }

    async fn remove_job_queue(&self, name: &str) -> Result<(), StoreError> {
        self.batch
            .disable_job_queue(name)
            .await
            .map_err(to_store_error)?;
        for _ in 0..BATCH_DISABLE_POLLS {
            match self
                .batch
                .describe_job_queue(name)
                .await
                .map_err(to_store_error)?
            {
                None => return Ok(()),
                Some(detail) => {
                    let status = detail.status().map(|st| st.as_str());
                    if detail.state().as_str() == "DISABLED" && status != Some("UPDATING") {
                        break;
                    }
                }
            }
            tokio::time::sleep(BATCH_DISABLE_DELAY).await;
        }
        self.batch.delete_job_queue(name).await.map_err(to_store_error)
    }

    /// Environment pairs for a job definition, from the resolved props
    fn job_definition_environment(resource: &ResolvedResource) -> Vec<(String, String)> {
        let mut environment = Vec::new();
        for (var_key, value_key) in [
            ("env_stack_var", "env_stack_value"),
            ("env_region_var", "env_region_value"),
        ] {
            if let (Some(var), Some(value)) = (
                resource.property(var_key).and_then(ResolvedValue::as_str),
                resource.property(value_key).and_then(ResolvedValue::as_str),
            ) {
                environment.push((var.to_string(), value.to_string()));
            }
        }
        environment
    }
}

#[async_trait]
impl ResourceStore for AwsStore {
    async fn lookup(
        &self,
        stack: &str,
        logical_name: &str,
        kind: ResourceKind,
    ) -> Result<Option<LiveResource>, StoreError> {
        match kind {
            ResourceKind::Vpc => {
                let Some(vpc) = self
                    .ec2
                    .find_vpc(stack, logical_name)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let id = s(vpc.vpc_id());
                Ok(Some(live(
                    id.clone(),
                    vec![(attr::ID, id)],
                    vec![
                        str_prop("cidr", vpc.cidr_block().unwrap_or_default()),
                        ("dns_support".to_string(), ResolvedValue::Bool(true)),
                    ],
                )))
            }
            ResourceKind::Subnet => {
                let Some(subnet) = self
                    .ec2
                    .find_subnet(stack, logical_name)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let id = s(subnet.subnet_id());
                let az_index = match subnet.availability_zone() {
                    Some(zone) => self.zone_index(zone).await?,
                    None => 0,
                };
                Ok(Some(live(
                    id.clone(),
                    vec![(attr::ID, id)],
                    vec![
                        str_prop("vpc", subnet.vpc_id().unwrap_or_default()),
                        str_prop("cidr", subnet.cidr_block().unwrap_or_default()),
                        int_prop("az_index", az_index),
                        (
                            "public".to_string(),
                            ResolvedValue::Bool(subnet.map_public_ip_on_launch().unwrap_or(false)),
                        ),
                    ],
                )))
            }
            ResourceKind::SecurityGroup => {
                let Some(group) = self
                    .ec2
                    .find_security_group(stack, logical_name)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let id = s(group.group_id());
                Ok(Some(live(
                    id.clone(),
                    vec![(attr::ID, id)],
                    vec![
                        str_prop("vpc", group.vpc_id().unwrap_or_default()),
                        str_prop("description", group.description().unwrap_or_default()),
                    ],
                )))
            }
            ResourceKind::SecurityGroupIngress => {
                let Some(group) = self
                    .ec2
                    .find_security_group(stack, "SecurityGroup")
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let group_id = s(group.group_id());
                let Some(rule) = self
                    .ec2
                    .find_group_ingress(&group_id)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let rule_id = s(rule.security_group_rule_id());
                let source = rule
                    .referenced_group_info()
                    .and_then(|info| info.group_id())
                    .unwrap_or_default()
                    .to_string();
                Ok(Some(live(
                    rule_id.clone(),
                    vec![(attr::ID, rule_id)],
                    vec![
                        str_prop("group", &group_id),
                        str_prop("source_group", &source),
                        str_prop("protocol", rule.ip_protocol().unwrap_or_default()),
                        int_prop("from_port", rule.from_port().unwrap_or_default().into()),
                        int_prop("to_port", rule.to_port().unwrap_or_default().into()),
                    ],
                )))
            }
            ResourceKind::InternetGateway => {
                let Some(igw) = self
                    .ec2
                    .find_internet_gateway(stack, logical_name)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let id = s(igw.internet_gateway_id());
                Ok(Some(live(id.clone(), vec![(attr::ID, id)], vec![])))
            }
            ResourceKind::GatewayAttachment => {
                let Some(igw) = self
                    .ec2
                    .find_internet_gateway(stack, "InternetGateway")
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let igw_id = s(igw.internet_gateway_id());
                let Some(vpc_id) = igw
                    .attachments()
                    .first()
                    .and_then(|a| a.vpc_id())
                    .map(str::to_string)
                else {
                    return Ok(None);
                };
                let id = format!("{igw_id}:{vpc_id}");
                Ok(Some(live(
                    id.clone(),
                    vec![(attr::ID, id)],
                    vec![str_prop("vpc", &vpc_id), str_prop("gateway", &igw_id)],
                )))
            }
            ResourceKind::RouteTable => {
                let Some(table) = self
                    .ec2
                    .find_route_table(stack, logical_name)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let id = s(table.route_table_id());
                Ok(Some(live(
                    id.clone(),
                    vec![(attr::ID, id)],
                    vec![str_prop("vpc", table.vpc_id().unwrap_or_default())],
                )))
            }
            ResourceKind::Route => {
                let Some(table) = self
                    .ec2
                    .find_route_table(stack, "RouteTable")
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let rtb_id = s(table.route_table_id());
                let vpc_id = s(table.vpc_id());
                let Some(route) = table
                    .routes()
                    .iter()
                    .find(|r| r.gateway_id().is_some_and(|g| g.starts_with("igw-")))
                else {
                    return Ok(None);
                };
                let gateway = s(route.gateway_id());
                let destination = s(route.destination_cidr_block());
                let id = format!("{rtb_id}:{destination}");
                Ok(Some(live(
                    id.clone(),
                    vec![(attr::ID, id)],
                    vec![
                        str_prop("route_table", &rtb_id),
                        str_prop("gateway", &gateway),
                        str_prop("attachment", &format!("{gateway}:{vpc_id}")),
                        str_prop("destination", &destination),
                    ],
                )))
            }
            ResourceKind::SubnetRouteTableAssociation => {
                let Some(subnet_logical) = logical_name.strip_suffix("RouteAssoc") else {
                    return Ok(None);
                };
                let Some(subnet) = self
                    .ec2
                    .find_subnet(stack, subnet_logical)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let subnet_id = s(subnet.subnet_id());
                let Some(table) = self
                    .ec2
                    .find_route_table(stack, "RouteTable")
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let rtb_id = s(table.route_table_id());
                let Some(assoc) = table
                    .associations()
                    .iter()
                    .find(|a| a.subnet_id() == Some(subnet_id.as_str()))
                else {
                    return Ok(None);
                };
                let id = s(assoc.route_table_association_id());
                Ok(Some(live(
                    id.clone(),
                    vec![(attr::ID, id)],
                    vec![
                        str_prop("subnet", &subnet_id),
                        str_prop("route_table", &rtb_id),
                    ],
                )))
            }
            ResourceKind::VpcEndpoint => {
                let Some(endpoint) = self
                    .ec2
                    .find_vpc_endpoint(stack, logical_name)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let id = s(endpoint.vpc_endpoint_id());
                let service = endpoint
                    .service_name()
                    .and_then(|n| n.rsplit('.').next())
                    .unwrap_or_default()
                    .to_string();
                Ok(Some(live(
                    id.clone(),
                    vec![(attr::ID, id)],
                    vec![
                        str_prop("vpc", endpoint.vpc_id().unwrap_or_default()),
                        str_prop(
                            "route_table",
                            endpoint
                                .route_table_ids()
                                .first()
                                .map(String::as_str)
                                .unwrap_or_default(),
                        ),
                        str_prop("service", &service),
                    ],
                )))
            }
            ResourceKind::Repository => {
                let name = self.named(logical_name)?;
                let Some(repo) = self
                    .ecr
                    .describe_repository(&name)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let days = self
                    .ecr
                    .untagged_retention_days(&name)
                    .await
                    .map_err(to_store_error)?
                    .unwrap_or(0);
                Ok(Some(live(
                    name.clone(),
                    vec![
                        (attr::ID, name.clone()),
                        (attr::NAME, name.clone()),
                        (attr::ARN, s(repo.repository_arn())),
                        (attr::URI, s(repo.repository_uri())),
                    ],
                    vec![
                        str_prop("name", &name),
                        int_prop("untagged_retention_days", days),
                    ],
                )))
            }
            ResourceKind::Role => {
                let name = self.named(logical_name)?;
                let Some(role) = self.iam.get_role(&name).await.map_err(to_store_error)? else {
                    return Ok(None);
                };
                let mut properties = vec![
                    str_prop("name", &name),
                    str_prop(
                        "trusted_service",
                        &sniff_trusted_service(role.assume_role_policy_document().unwrap_or_default()),
                    ),
                ];
                let arns = self
                    .iam
                    .attached_policy_arns(&name)
                    .await
                    .map_err(to_store_error)?;
                properties.push((
                    "managed_policies".to_string(),
                    ResolvedValue::List(arns.into_iter().map(ResolvedValue::Str).collect()),
                ));
                Ok(Some(live(
                    name.clone(),
                    vec![
                        (attr::ID, name.clone()),
                        (attr::NAME, name),
                        (attr::ARN, role.arn().to_string()),
                    ],
                    properties,
                )))
            }
            ResourceKind::ManagedPolicy => {
                let name = self.named(logical_name)?;
                let arn = self.policy_arn(&name);
                let Some(policy) = self.iam.get_policy(&arn).await.map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                // The default version's document is part of the drift
                // surface; a converged policy must diff as Noop.
                let document = match policy.default_version_id() {
                    Some(version) => self
                        .iam
                        .policy_version_document(&arn, version)
                        .await
                        .map_err(to_store_error)?,
                    None => String::new(),
                };
                Ok(Some(live(
                    arn.clone(),
                    vec![
                        (attr::ID, arn.clone()),
                        (attr::NAME, name.clone()),
                        (attr::ARN, arn),
                    ],
                    vec![str_prop("name", &name), str_prop("document", &document)],
                )))
            }
            ResourceKind::InstanceProfile => {
                let name = self.named(logical_name)?;
                let Some(profile) = self
                    .iam
                    .get_instance_profile(&name)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let role = profile
                    .roles()
                    .first()
                    .map(|r| r.role_name().to_string())
                    .unwrap_or_default();
                Ok(Some(live(
                    name.clone(),
                    vec![
                        (attr::ID, name.clone()),
                        (attr::NAME, name.clone()),
                        (attr::ARN, profile.arn().to_string()),
                    ],
                    vec![str_prop("name", &name), str_prop("role", &role)],
                )))
            }
            ResourceKind::PlacementGroup => {
                let name = self.named(logical_name)?;
                let Some(group) = self
                    .ec2
                    .find_placement_group(&name)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let strategy = group
                    .strategy()
                    .map(|st| st.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(Some(live(
                    name.clone(),
                    vec![(attr::ID, name.clone()), (attr::NAME, name.clone())],
                    vec![str_prop("name", &name), str_prop("strategy", &strategy)],
                )))
            }
            ResourceKind::ComputeEnvironment => {
                let name = self.named(logical_name)?;
                let Some(detail) = self
                    .batch
                    .describe_compute_environment(&name)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let mut properties = vec![str_prop("name", &name)];
                if let Some(cr) = detail.compute_resources() {
                    properties.push(int_prop("min_vcpus", cr.minv_cpus().unwrap_or(0).into()));
                    properties.push(int_prop("max_vcpus", cr.maxv_cpus().into()));
                    properties.push(str_prop(
                        "instance_type",
                        cr.instance_types().first().map(String::as_str).unwrap_or_default(),
                    ));
                    properties.push((
                        "subnets".to_string(),
                        ResolvedValue::List(
                            cr.subnets()
                                .iter()
                                .map(|sn| ResolvedValue::Str(sn.clone()))
                                .collect(),
                        ),
                    ));
                    properties.push(str_prop(
                        "security_group",
                        cr.security_group_ids()
                            .first()
                            .map(String::as_str)
                            .unwrap_or_default(),
                    ));
                    properties.push(str_prop(
                        "placement_group",
                        cr.placement_group().unwrap_or_default(),
                    ));
                    properties.push(str_prop(
                        "instance_profile",
                        cr.instance_role().unwrap_or_default(),
                    ));
                }
                properties.push(str_prop(
                    "service_role",
                    detail.service_role().unwrap_or_default(),
                ));
                Ok(Some(live(
                    name.clone(),
                    vec![
                        (attr::ID, name.clone()),
                        (attr::NAME, name),
                        (attr::ARN, detail.compute_environment_arn().to_string()),
                    ],
                    properties,
                )))
            }
            ResourceKind::JobQueue => {
                let name = self.named(logical_name)?;
                let Some(detail) = self
                    .batch
                    .describe_job_queue(&name)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let compute_environment = detail
                    .compute_environment_order()
                    .first()
                    .map(|order| order.compute_environment().to_string())
                    .unwrap_or_default();
                Ok(Some(live(
                    name.clone(),
                    vec![
                        (attr::ID, name.clone()),
                        (attr::NAME, name),
                        (attr::ARN, detail.job_queue_arn().to_string()),
                    ],
                    vec![
                        str_prop("name", detail.job_queue_name()),
                        int_prop("priority", detail.priority().into()),
                        str_prop("compute_environment", &compute_environment),
                    ],
                )))
            }
            ResourceKind::JobDefinition => {
                let name = self.named(logical_name)?;
                let Some(definition) = self
                    .batch
                    .describe_job_definition(&name)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Ok(None);
                };
                let arn = definition.job_definition_arn().to_string();
                let mut properties = vec![str_prop("name", &name)];
                if let Some(container) = definition.container_properties() {
                    let (image, tag) = container
                        .image()
                        .and_then(|i| i.rsplit_once(':'))
                        .unwrap_or((container.image().unwrap_or_default(), ""));
                    properties.push(str_prop("image", image));
                    properties.push(str_prop("image_tag", tag));
                    for requirement in container.resource_requirements() {
                        let value = requirement.value().parse::<i64>().unwrap_or(0);
                        match requirement.r#type().as_str() {
                            "VCPU" => properties.push(int_prop("vcpus", value)),
                            "MEMORY" => properties.push(int_prop("memory_mb", value)),
                            _ => {}
                        }
                    }
                    for pair in container.environment() {
                        match pair.name() {
                            Some(n) if n == ENV_STACK => {
                                properties.push(str_prop("env_stack_var", n));
                                properties
                                    .push(str_prop("env_stack_value", pair.value().unwrap_or_default()));
                            }
                            Some(n) if n == ENV_REGION => {
                                properties.push(str_prop("env_region_var", n));
                                properties.push(str_prop(
                                    "env_region_value",
                                    pair.value().unwrap_or_default(),
                                ));
                            }
                            _ => {}
                        }
                    }
                }
                Ok(Some(live(
                    arn.clone(),
                    vec![
                        (attr::ID, arn.clone()),
                        (attr::NAME, name),
                        (attr::ARN, arn),
                    ],
                    properties,
                )))
            }
        }
    }

    async fn create(
        &self,
        stack: &str,
        resource: &ResolvedResource,
    ) -> Result<LiveResource, StoreError> {
        // An earlier interrupted apply may already have created this one
        if let Some(existing) = self
            .lookup(stack, &resource.logical_name, resource.kind)
            .await?
        {
            debug!(resource = %resource.logical_name, "create found existing resource");
            return Ok(existing);
        }

        let logical = resource.logical_name.as_str();
        let properties = resource.properties.clone();
        match resource.kind {
            ResourceKind::Vpc => {
                let cidr = resource.str_property("cidr")?;
                let id = self
                    .ec2
                    .create_vpc(stack, logical, cidr)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(id.clone(), vec![(attr::ID, id)], properties))
            }
            ResourceKind::Subnet => {
                let vpc = resource.str_property("vpc")?;
                let cidr = resource.str_property("cidr")?;
                let az_index = resource.int_property("az_index")? as usize;
                let public = matches!(
                    resource.property("public"),
                    Some(ResolvedValue::Bool(true))
                );
                let zone = self
                    .ec2
                    .availability_zone(az_index)
                    .await
                    .map_err(to_store_error)?;
                let id = self
                    .ec2
                    .create_subnet(stack, logical, vpc, cidr, &zone, public)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(id.clone(), vec![(attr::ID, id)], properties))
            }
            ResourceKind::SecurityGroup => {
                let vpc = resource.str_property("vpc")?;
                let description = resource.str_property("description")?;
                let id = self
                    .ec2
                    .create_security_group(stack, logical, vpc, description)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(id.clone(), vec![(attr::ID, id)], properties))
            }
            ResourceKind::SecurityGroupIngress => {
                let group = resource.str_property("group")?;
                let source = resource.str_property("source_group")?;
                let protocol = resource.str_property("protocol")?;
                let from_port = int32(resource, "from_port")?;
                let to_port = int32(resource, "to_port")?;
                let id = self
                    .ec2
                    .authorize_group_ingress(group, source, protocol, from_port, to_port)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(id.clone(), vec![(attr::ID, id)], properties))
            }
            ResourceKind::InternetGateway => {
                let id = self
                    .ec2
                    .create_internet_gateway(stack, logical)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(id.clone(), vec![(attr::ID, id)], properties))
            }
            ResourceKind::GatewayAttachment => {
                let vpc = resource.str_property("vpc")?;
                let gateway = resource.str_property("gateway")?;
                self.ec2
                    .attach_internet_gateway(gateway, vpc)
                    .await
                    .map_err(to_store_error)?;
                let id = format!("{gateway}:{vpc}");
                Ok(live(id.clone(), vec![(attr::ID, id)], properties))
            }
            ResourceKind::RouteTable => {
                let vpc = resource.str_property("vpc")?;
                let id = self
                    .ec2
                    .create_route_table(stack, logical, vpc)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(id.clone(), vec![(attr::ID, id)], properties))
            }
            ResourceKind::Route => {
                let table = resource.str_property("route_table")?;
                let destination = resource.str_property("destination")?;
                let gateway = resource.str_property("gateway")?;
                self.ec2
                    .create_route(table, destination, gateway)
                    .await
                    .map_err(to_store_error)?;
                let id = format!("{table}:{destination}");
                Ok(live(id.clone(), vec![(attr::ID, id)], properties))
            }
            ResourceKind::SubnetRouteTableAssociation => {
                let table = resource.str_property("route_table")?;
                let subnet = resource.str_property("subnet")?;
                let id = self
                    .ec2
                    .associate_route_table(table, subnet)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(id.clone(), vec![(attr::ID, id)], properties))
            }
            ResourceKind::VpcEndpoint => {
                let vpc = resource.str_property("vpc")?;
                let table = resource.str_property("route_table")?;
                let service = resource.str_property("service")?;
                let id = self
                    .ec2
                    .create_vpc_endpoint(stack, logical, vpc, self.ctx.region(), service, table)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(id.clone(), vec![(attr::ID, id)], properties))
            }
            ResourceKind::Repository => {
                let name = resource.str_property("name")?;
                let days = resource.int_property("untagged_retention_days")?;
                let (arn, uri) = self
                    .ecr
                    .create_repository(name)
                    .await
                    .map_err(to_store_error)?;
                self.ecr
                    .put_untagged_expiry(name, days)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(
                    name.to_string(),
                    vec![
                        (attr::ID, name.to_string()),
                        (attr::NAME, name.to_string()),
                        (attr::ARN, arn),
                        (attr::URI, uri),
                    ],
                    properties,
                ))
            }
            ResourceKind::Role => {
                let name = resource.str_property("name")?;
                let trusted = resource.str_property("trusted_service")?;
                let arn = self
                    .iam
                    .create_role(stack, logical, name, trusted)
                    .await
                    .map_err(to_store_error)?;
                for policy_arn in str_list(resource, "managed_policies")? {
                    self.iam
                        .attach_role_policy(name, &policy_arn)
                        .await
                        .map_err(to_store_error)?;
                }
                Ok(live(
                    name.to_string(),
                    vec![
                        (attr::ID, name.to_string()),
                        (attr::NAME, name.to_string()),
                        (attr::ARN, arn),
                    ],
                    properties,
                ))
            }
            ResourceKind::ManagedPolicy => {
                let name = resource.str_property("name")?;
                let document = resource.str_property("document")?;
                let arn = self
                    .iam
                    .create_policy(stack, logical, name, document)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(
                    arn.clone(),
                    vec![
                        (attr::ID, arn.clone()),
                        (attr::NAME, name.to_string()),
                        (attr::ARN, arn),
                    ],
                    properties,
                ))
            }
            ResourceKind::InstanceProfile => {
                let name = resource.str_property("name")?;
                let role = resource.str_property("role")?;
                let arn = self
                    .iam
                    .create_instance_profile(stack, logical, name, role)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(
                    name.to_string(),
                    vec![
                        (attr::ID, name.to_string()),
                        (attr::NAME, name.to_string()),
                        (attr::ARN, arn),
                    ],
                    properties,
                ))
            }
            ResourceKind::PlacementGroup => {
                let name = resource.str_property("name")?;
                let strategy = resource.str_property("strategy")?;
                self.ec2
                    .create_placement_group(stack, logical, name, strategy)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(
                    name.to_string(),
                    vec![(attr::ID, name.to_string()), (attr::NAME, name.to_string())],
                    properties,
                ))
            }
            ResourceKind::ComputeEnvironment => {
                let name = resource.str_property("name")?;
                let arn = self
                    .batch
                    .create_compute_environment(ComputeEnvironmentSpec {
                        name,
                        min_vcpus: int32(resource, "min_vcpus")?,
                        max_vcpus: int32(resource, "max_vcpus")?,
                        instance_type: resource.str_property("instance_type")?,
                        subnets: str_list(resource, "subnets")?,
                        security_group: resource.str_property("security_group")?,
                        placement_group: resource.str_property("placement_group")?,
                        instance_profile_arn: resource.str_property("instance_profile")?,
                        service_role_arn: resource.str_property("service_role")?,
                    })
                    .await
                    .map_err(to_store_error)?;
                Ok(live(
                    name.to_string(),
                    vec![
                        (attr::ID, name.to_string()),
                        (attr::NAME, name.to_string()),
                        (attr::ARN, arn),
                    ],
                    properties,
                ))
            }
            ResourceKind::JobQueue => {
                let name = resource.str_property("name")?;
                let priority = int32(resource, "priority")?;
                let compute_environment = resource.str_property("compute_environment")?;
                let arn = self
                    .batch
                    .create_job_queue(name, priority, compute_environment)
                    .await
                    .map_err(to_store_error)?;
                Ok(live(
                    name.to_string(),
                    vec![
                        (attr::ID, name.to_string()),
                        (attr::NAME, name.to_string()),
                        (attr::ARN, arn),
                    ],
                    properties,
                ))
            }
            ResourceKind::JobDefinition => {
                let name = resource.str_property("name")?;
                let image = format!(
                    "{}:{}",
                    resource.str_property("image")?,
                    resource.str_property("image_tag")?
                );
                let arn = self
                    .batch
                    .register_job_definition(JobDefinitionSpec {
                        name,
                        image: &image,
                        vcpus: resource.int_property("vcpus")?,
                        memory_mb: resource.int_property("memory_mb")?,
                        environment: Self::job_definition_environment(resource),
                    })
                    .await
                    .map_err(to_store_error)?;
                Ok(live(
                    arn.clone(),
                    vec![
                        (attr::ID, arn.clone()),
                        (attr::NAME, name.to_string()),
                        (attr::ARN, arn),
                    ],
                    properties,
                ))
            }
        }
    }

    async fn update(
        &self,
        stack: &str,
        current: &LiveResource,
        resource: &ResolvedResource,
    ) -> Result<LiveResource, StoreError> {
        match resource.kind {
            ResourceKind::ComputeEnvironment => {
                let name = resource.str_property("name")?;
                self.batch
                    .update_compute_environment_capacity(
                        name,
                        int32(resource, "min_vcpus")?,
                        int32(resource, "max_vcpus")?,
                    )
                    .await
                    .map_err(to_store_error)?;
            }
            ResourceKind::Repository => {
                let name = resource.str_property("name")?;
                self.ecr
                    .put_untagged_expiry(name, resource.int_property("untagged_retention_days")?)
                    .await
                    .map_err(to_store_error)?;
            }
            ResourceKind::Role => {
                let name = resource.str_property("name")?;
                let desired = str_list(resource, "managed_policies")?;
                let attached = self
                    .iam
                    .attached_policy_arns(name)
                    .await
                    .map_err(to_store_error)?;
                for arn in desired.iter().filter(|a| !attached.contains(a)) {
                    self.iam
                        .attach_role_policy(name, arn)
                        .await
                        .map_err(to_store_error)?;
                }
                for arn in attached.iter().filter(|a| !desired.contains(a)) {
                    self.iam
                        .detach_role_policy(name, arn)
                        .await
                        .map_err(to_store_error)?;
                }
            }
            ResourceKind::ManagedPolicy => {
                let document = resource.str_property("document")?;
                self.iam
                    .put_policy_document(&current.remote_id, document)
                    .await
                    .map_err(to_store_error)?;
            }
            ResourceKind::JobQueue => {
                let name = resource.str_property("name")?;
                self.batch
                    .update_job_queue(
                        name,
                        int32(resource, "priority")?,
                        resource.str_property("compute_environment")?,
                    )
                    .await
                    .map_err(to_store_error)?;
            }
            ResourceKind::JobDefinition => {
                // Definitions are versioned; an update is a new revision
                return self.create_unconditionally(resource).await;
            }
            other => {
                return Err(StoreError::Rejected(format!(
                    "{other} does not support in-place updates"
                )));
            }
        }

        self.lookup(stack, &resource.logical_name, resource.kind)
            .await?
            .ok_or(StoreError::NotFound)
            .map(|mut refreshed| {
                refreshed.created_at = current.created_at;
                refreshed
            })
    }

    async fn health(
        &self,
        _stack: &str,
        kind: ResourceKind,
        remote_id: &str,
    ) -> Result<RemoteHealth, StoreError> {
        let state = match kind {
            ResourceKind::Vpc => self
                .ec2
                .describe_vpc(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|v| readiness(v.state().map(|st| st.as_str()).unwrap_or(""), "available")),
            ResourceKind::Subnet => self
                .ec2
                .describe_subnet(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|sn| readiness(sn.state().map(|st| st.as_str()).unwrap_or(""), "available")),
            ResourceKind::SecurityGroup => self
                .ec2
                .describe_security_group(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|_| RemoteHealth::Ready),
            ResourceKind::SecurityGroupIngress => self
                .ec2
                .describe_ingress_rule(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|_| RemoteHealth::Ready),
            ResourceKind::InternetGateway => self
                .ec2
                .describe_internet_gateway(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|_| RemoteHealth::Ready),
            ResourceKind::GatewayAttachment => {
                let Some((igw_id, vpc_id)) = remote_id.split_once(':') else {
                    return Err(StoreError::Rejected(format!(
                        "malformed attachment id '{remote_id}'"
                    )));
                };
                self.ec2
                    .describe_internet_gateway(igw_id)
                    .await
                    .map_err(to_store_error)?
                    .and_then(|igw| {
                        igw.attachments()
                            .iter()
                            .find(|a| a.vpc_id() == Some(vpc_id))
                            .map(|a| {
                                readiness_any(
                                    a.state().map(|st| st.as_str()).unwrap_or(""),
                                    &["available", "attached"],
                                )
                            })
                    })
            }
            ResourceKind::RouteTable => self
                .ec2
                .describe_route_table(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|_| RemoteHealth::Ready),
            ResourceKind::Route => {
                let Some((rtb_id, destination)) = remote_id.split_once(':') else {
                    return Err(StoreError::Rejected(format!(
                        "malformed route id '{remote_id}'"
                    )));
                };
                self.ec2
                    .describe_route_table(rtb_id)
                    .await
                    .map_err(to_store_error)?
                    .and_then(|table| {
                        table
                            .routes()
                            .iter()
                            .find(|r| r.destination_cidr_block() == Some(destination))
                            .map(|r| {
                                readiness(r.state().map(|st| st.as_str()).unwrap_or(""), "active")
                            })
                    })
            }
            ResourceKind::SubnetRouteTableAssociation => self
                .ec2
                .describe_association(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|a| {
                    readiness(
                        a.association_state()
                            .and_then(|st| st.state())
                            .map(|code| code.as_str())
                            .unwrap_or(""),
                        "associated",
                    )
                }),
            ResourceKind::VpcEndpoint => self
                .ec2
                .describe_vpc_endpoint(remote_id)
                .await
                .map_err(to_store_error)?
                .and_then(|e| {
                    let state = e.state().map(|st| st.as_str()).unwrap_or("");
                    if state.eq_ignore_ascii_case("deleted") {
                        None
                    } else {
                        Some(readiness_any(state, &["available", "Available"]))
                    }
                }),
            ResourceKind::PlacementGroup => self
                .ec2
                .find_placement_group(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|g| {
                    readiness(g.state().map(|st| st.as_str()).unwrap_or(""), "available")
                }),
            ResourceKind::Repository => self
                .ecr
                .describe_repository(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|_| RemoteHealth::Ready),
            ResourceKind::Role => self
                .iam
                .get_role(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|_| RemoteHealth::Ready),
            ResourceKind::ManagedPolicy => self
                .iam
                .get_policy(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|_| RemoteHealth::Ready),
            ResourceKind::InstanceProfile => self
                .iam
                .get_instance_profile(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|_| RemoteHealth::Ready),
            ResourceKind::ComputeEnvironment => self
                .batch
                .describe_compute_environment(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|detail| match detail.status().map(|st| st.as_str()) {
                    Some("VALID") => RemoteHealth::Ready,
                    Some("INVALID") => RemoteHealth::Failed(
                        detail.status_reason().unwrap_or("invalid").to_string(),
                    ),
                    Some("DELETED") => RemoteHealth::Gone,
                    _ => RemoteHealth::Creating,
                }),
            ResourceKind::JobQueue => self
                .batch
                .describe_job_queue(remote_id)
                .await
                .map_err(to_store_error)?
                .map(|detail| match detail.status().map(|st| st.as_str()) {
                    Some("VALID") => RemoteHealth::Ready,
                    Some("INVALID") => RemoteHealth::Failed(
                        detail.status_reason().unwrap_or("invalid").to_string(),
                    ),
                    Some("DELETED") => RemoteHealth::Gone,
                    _ => RemoteHealth::Creating,
                }),
            ResourceKind::JobDefinition => {
                // Remote id is the revision ARN; look the name up from it
                let name = remote_id
                    .rsplit('/')
                    .next()
                    .and_then(|tail| tail.split(':').next())
                    .unwrap_or(remote_id);
                self.batch
                    .describe_job_definition(name)
                    .await
                    .map_err(to_store_error)?
                    .map(|_| RemoteHealth::Ready)
            }
        };

        Ok(state.unwrap_or(RemoteHealth::Gone))
    }

    async fn delete(
        &self,
        _stack: &str,
        kind: ResourceKind,
        remote_id: &str,
    ) -> Result<(), StoreError> {
        match kind {
            ResourceKind::Vpc => self.ec2.delete_vpc(remote_id).await.map_err(to_store_error),
            ResourceKind::Subnet => self
                .ec2
                .delete_subnet(remote_id)
                .await
                .map_err(to_store_error),
            ResourceKind::SecurityGroup => self
                .ec2
                .delete_security_group(remote_id)
                .await
                .map_err(to_store_error),
            ResourceKind::SecurityGroupIngress => {
                let Some(rule) = self
                    .ec2
                    .describe_ingress_rule(remote_id)
                    .await
                    .map_err(to_store_error)?
                else {
                    return Err(StoreError::NotFound);
                };
                let group = s(rule.group_id());
                self.ec2
                    .revoke_group_ingress(&group, remote_id)
                    .await
                    .map_err(to_store_error)
            }
            ResourceKind::InternetGateway => self
                .ec2
                .delete_internet_gateway(remote_id)
                .await
                .map_err(to_store_error),
            ResourceKind::GatewayAttachment => {
                let Some((igw_id, vpc_id)) = remote_id.split_once(':') else {
                    return Err(StoreError::Rejected(format!(
                        "malformed attachment id '{remote_id}'"
                    )));
                };
                self.ec2
                    .detach_internet_gateway(igw_id, vpc_id)
                    .await
                    .map_err(to_store_error)
            }
            ResourceKind::RouteTable => self
                .ec2
                .delete_route_table(remote_id)
                .await
                .map_err(to_store_error),
            ResourceKind::Route => {
                let Some((rtb_id, destination)) = remote_id.split_once(':') else {
                    return Err(StoreError::Rejected(format!(
                        "malformed route id '{remote_id}'"
                    )));
                };
                self.ec2
                    .delete_route(rtb_id, destination)
                    .await
                    .map_err(to_store_error)
            }
            ResourceKind::SubnetRouteTableAssociation => self
                .ec2
                .disassociate_route_table(remote_id)
                .await
                .map_err(to_store_error),
            ResourceKind::VpcEndpoint => self
                .ec2
                .delete_vpc_endpoint(remote_id)
                .await
                .map_err(to_store_error),
            ResourceKind::PlacementGroup => self
                .ec2
                .delete_placement_group(remote_id)
                .await
                .map_err(to_store_error),
            ResourceKind::Repository => self
                .ecr
                .delete_repository(remote_id)
                .await
                .map_err(to_store_error),
            ResourceKind::Role => self.iam.delete_role(remote_id).await.map_err(to_store_error),
            ResourceKind::ManagedPolicy => self
                .iam
                .delete_policy(remote_id)
                .await
                .map_err(to_store_error),
            ResourceKind::InstanceProfile => self
                .iam
                .delete_instance_profile(remote_id)
                .await
                .map_err(to_store_error),
            ResourceKind::ComputeEnvironment => self.remove_compute_environment(remote_id).await,
            ResourceKind::JobQueue => self.remove_job_queue(remote_id).await,
            ResourceKind::JobDefinition => self
                .batch
                .deregister_job_definition(remote_id)
                .await
                .map_err(to_store_error),
        }
    }
}

impl AwsStore {
    /// Register a job definition revision without the idempotency lookup
    async fn create_unconditionally(
        &self,
        resource: &ResolvedResource,
    ) -> Result<LiveResource, StoreError> {
        let name = resource.str_property("name")?;
        let image = format!(
            "{}:{}",
            resource.str_property("image")?,
            resource.str_property("image_tag")?
        );
        let arn = self
            .batch
            .register_job_definition(JobDefinitionSpec {
                name,
                image: &image,
                vcpus: resource.int_property("vcpus")?,
                memory_mb: resource.int_property("memory_mb")?,
                environment: Self::job_definition_environment(resource),
            })
            .await
            .map_err(to_store_error)?;
        Ok(live(
            arn.clone(),
            vec![
                (attr::ID, arn.clone()),
                (attr::NAME, name.to_string()),
                (attr::ARN, arn),
            ],
            resource.properties.clone(),
        ))
    }
}

fn readiness(state: &str, ready: &str) -> RemoteHealth {
    if state == ready {
        RemoteHealth::Ready
    } else {
        RemoteHealth::Creating
    }
}

fn readiness_any(state: &str, ready: &[&str]) -> RemoteHealth {
    if ready.contains(&state) {
        RemoteHealth::Ready
    } else {
        RemoteHealth::Creating
    }
}
