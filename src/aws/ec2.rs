//! EC2 network plumbing
//!
//! Thin wrappers over the EC2 client for everything the stack's network
//! layer needs: VPC, subnets, security group and its self-ingress rule,
//! internet gateway, routing, the storage endpoint, and the placement
//! group. Every taggable resource carries the stack and logical-name tags
//! so lookups are idempotent across runs.

use crate::aws::context::AwsContext;
use crate::aws::error::sdk_error;
use anyhow::{Context, Result};
use aws_sdk_ec2::types::{
    AttributeBooleanValue, Filter, InternetGateway, IpPermission, PlacementGroup,
    PlacementStrategy, ResourceType, RouteTable, SecurityGroup, SecurityGroupRule, Subnet, Tag,
    TagSpecification, UserIdGroupPair, Vpc, VpcEndpoint,
};
use aws_sdk_ec2::Client;
use tracing::{debug, info};

/// Tag keys marking a resource as owned by a stack
pub const STACK_TAG: &str = "rios-batch:stack";
pub const LOGICAL_TAG: &str = "rios-batch:logical";

pub struct Ec2Client {
    client: Client,
}

fn tag_spec(resource_type: ResourceType, stack: &str, logical: &str) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource_type)
        .tags(Tag::builder().key(STACK_TAG).value(stack).build())
        .tags(Tag::builder().key(LOGICAL_TAG).value(logical).build())
        .build()
}

fn stack_filters(stack: &str, logical: &str) -> Vec<Filter> {
    vec![
        Filter::builder()
            .name(format!("tag:{STACK_TAG}"))
            .values(stack)
            .build(),
        Filter::builder()
            .name(format!("tag:{LOGICAL_TAG}"))
            .values(logical)
            .build(),
    ]
}

impl Ec2Client {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.ec2_client(),
        }
    }

    /// Available zone names, ordered by name so indices are stable
    pub async fn availability_zone_names(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .describe_availability_zones()
            .filters(Filter::builder().name("state").values("available").build())
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe availability zones")?;

        let mut names: Vec<String> = response
            .availability_zones()
            .iter()
            .filter_map(|az| az.zone_name().map(str::to_string))
            .collect();
        names.sort_unstable();
        Ok(names)
    }

    /// Zone name for a stable zone index
    pub async fn availability_zone(&self, index: usize) -> Result<String> {
        self.availability_zone_names()
            .await?
            .get(index)
            .cloned()
            .with_context(|| format!("region has no availability zone at index {index}"))
    }

    pub async fn create_vpc(&self, stack: &str, logical: &str, cidr: &str) -> Result<String> {
        let response = self
            .client
            .create_vpc()
            .cidr_block(cidr)
            .tag_specifications(tag_spec(ResourceType::Vpc, stack, logical))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create VPC")?;
        let vpc_id = response
            .vpc()
            .and_then(|v| v.vpc_id())
            .context("CreateVpc returned no VPC id")?
            .to_string();

        // Endpoint DNS resolution needs hostnames enabled
        self.client
            .modify_vpc_attribute()
            .vpc_id(&vpc_id)
            .enable_dns_hostnames(AttributeBooleanValue::builder().value(true).build())
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to enable DNS hostnames")?;

        info!(vpc_id, cidr, "VPC created");
        Ok(vpc_id)
    }

    pub async fn find_vpc(&self, stack: &str, logical: &str) -> Result<Option<Vpc>> {
        let response = self
            .client
            .describe_vpcs()
            .set_filters(Some(stack_filters(stack, logical)))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe VPCs")?;
        Ok(response.vpcs().first().cloned())
    }

    pub async fn describe_vpc(&self, vpc_id: &str) -> Result<Option<Vpc>> {
        let response = self
            .client
            .describe_vpcs()
            .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe VPC")?;
        Ok(response.vpcs().first().cloned())
    }

    pub async fn delete_vpc(&self, vpc_id: &str) -> Result<()> {
        self.client
            .delete_vpc()
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete VPC")?;
        info!(vpc_id, "VPC deleted");
        Ok(())
    }

    pub async fn create_subnet(
        &self,
        stack: &str,
        logical: &str,
        vpc_id: &str,
        cidr: &str,
        zone: &str,
        public: bool,
    ) -> Result<String> {
        let response = self
            .client
            .create_subnet()
            .vpc_id(vpc_id)
            .cidr_block(cidr)
            .availability_zone(zone)
            .tag_specifications(tag_spec(ResourceType::Subnet, stack, logical))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create subnet")?;
        let subnet_id = response
            .subnet()
            .and_then(|s| s.subnet_id())
            .context("CreateSubnet returned no subnet id")?
            .to_string();

        if public {
            self.client
                .modify_subnet_attribute()
                .subnet_id(&subnet_id)
                .map_public_ip_on_launch(AttributeBooleanValue::builder().value(true).build())
                .send()
                .await
                .map_err(sdk_error)
                .context("failed to enable public IP mapping")?;
        }

        info!(subnet_id, cidr, zone, "subnet created");
        Ok(subnet_id)
    }

    pub async fn find_subnet(&self, stack: &str, logical: &str) -> Result<Option<Subnet>> {
        let response = self
            .client
            .describe_subnets()
            .set_filters(Some(stack_filters(stack, logical)))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe subnets")?;
        Ok(response.subnets().first().cloned())
    }

    pub async fn describe_subnet(&self, subnet_id: &str) -> Result<Option<Subnet>> {
        let response = self
            .client
            .describe_subnets()
            .filters(Filter::builder().name("subnet-id").values(subnet_id).build())
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe subnet")?;
        Ok(response.subnets().first().cloned())
    }

    pub async fn delete_subnet(&self, subnet_id: &str) -> Result<()> {
        self.client
            .delete_subnet()
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete subnet")?;
        Ok(())
    }

    pub async fn create_security_group(
        &self,
        stack: &str,
        logical: &str,
        vpc_id: &str,
        description: &str,
    ) -> Result<String> {
        let response = self
            .client
            .create_security_group()
            .group_name(format!("{stack}-{logical}"))
            .description(description)
            .vpc_id(vpc_id)
            .tag_specifications(tag_spec(ResourceType::SecurityGroup, stack, logical))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create security group")?;
        let group_id = response
            .group_id()
            .context("CreateSecurityGroup returned no group id")?
            .to_string();
        info!(group_id, "security group created");
        Ok(group_id)
    }

    pub async fn find_security_group(
        &self,
        stack: &str,
        logical: &str,
    ) -> Result<Option<SecurityGroup>> {
        let response = self
            .client
            .describe_security_groups()
            .set_filters(Some(stack_filters(stack, logical)))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe security groups")?;
        Ok(response.security_groups().first().cloned())
    }

    pub async fn describe_security_group(&self, group_id: &str) -> Result<Option<SecurityGroup>> {
        let response = self
            .client
            .describe_security_groups()
            .filters(Filter::builder().name("group-id").values(group_id).build())
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe security group")?;
        Ok(response.security_groups().first().cloned())
    }

    pub async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        self.client
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete security group")?;
        Ok(())
    }

    /// Authorize a group-to-group TCP rule; used for the stack's
    /// self-referential inter-node rule.
    pub async fn authorize_group_ingress(
        &self,
        group_id: &str,
        source_group_id: &str,
        protocol: &str,
        from_port: i32,
        to_port: i32,
    ) -> Result<String> {
        let response = self
            .client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .ip_permissions(
                IpPermission::builder()
                    .ip_protocol(protocol)
                    .from_port(from_port)
                    .to_port(to_port)
                    .user_id_group_pairs(
                        UserIdGroupPair::builder().group_id(source_group_id).build(),
                    )
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to authorize ingress")?;
        let rule_id = response
            .security_group_rules()
            .first()
            .and_then(|r| r.security_group_rule_id())
            .context("AuthorizeSecurityGroupIngress returned no rule id")?
            .to_string();
        debug!(group_id, rule_id, "ingress authorized");
        Ok(rule_id)
    }

    /// The group-to-group ingress rule of `group_id`, if present
    pub async fn find_group_ingress(&self, group_id: &str) -> Result<Option<SecurityGroupRule>> {
        let response = self
            .client
            .describe_security_group_rules()
            .filters(Filter::builder().name("group-id").values(group_id).build())
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe security group rules")?;
        Ok(response
            .security_group_rules()
            .iter()
            .find(|rule| rule.is_egress() == Some(false) && rule.referenced_group_info().is_some())
            .cloned())
    }

    pub async fn describe_ingress_rule(&self, rule_id: &str) -> Result<Option<SecurityGroupRule>> {
        let response = self
            .client
            .describe_security_group_rules()
            .filters(
                Filter::builder()
                    .name("security-group-rule-id")
                    .values(rule_id)
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe ingress rule")?;
        Ok(response.security_group_rules().first().cloned())
    }

    pub async fn revoke_group_ingress(&self, group_id: &str, rule_id: &str) -> Result<()> {
        self.client
            .revoke_security_group_ingress()
            .group_id(group_id)
            .security_group_rule_ids(rule_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to revoke ingress")?;
        Ok(())
    }

    pub async fn create_internet_gateway(&self, stack: &str, logical: &str) -> Result<String> {
        let response = self
            .client
            .create_internet_gateway()
            .tag_specifications(tag_spec(ResourceType::InternetGateway, stack, logical))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create internet gateway")?;
        let igw_id = response
            .internet_gateway()
            .and_then(|g| g.internet_gateway_id())
            .context("CreateInternetGateway returned no id")?
            .to_string();
        info!(igw_id, "internet gateway created");
        Ok(igw_id)
    }

    pub async fn find_internet_gateway(
        &self,
        stack: &str,
        logical: &str,
    ) -> Result<Option<InternetGateway>> {
        let response = self
            .client
            .describe_internet_gateways()
            .set_filters(Some(stack_filters(stack, logical)))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe internet gateways")?;
        Ok(response.internet_gateways().first().cloned())
    }

    pub async fn describe_internet_gateway(
        &self,
        igw_id: &str,
    ) -> Result<Option<InternetGateway>> {
        let response = self
            .client
            .describe_internet_gateways()
            .filters(
                Filter::builder()
                    .name("internet-gateway-id")
                    .values(igw_id)
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe internet gateway")?;
        Ok(response.internet_gateways().first().cloned())
    }

    pub async fn delete_internet_gateway(&self, igw_id: &str) -> Result<()> {
        self.client
            .delete_internet_gateway()
            .internet_gateway_id(igw_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete internet gateway")?;
        Ok(())
    }

    pub async fn attach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> Result<()> {
        self.client
            .attach_internet_gateway()
            .internet_gateway_id(igw_id)
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to attach internet gateway")?;
        info!(igw_id, vpc_id, "internet gateway attached");
        Ok(())
    }

    pub async fn detach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> Result<()> {
        self.client
            .detach_internet_gateway()
            .internet_gateway_id(igw_id)
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to detach internet gateway")?;
        Ok(())
    }

    pub async fn create_route_table(
        &self,
        stack: &str,
        logical: &str,
        vpc_id: &str,
    ) -> Result<String> {
        let response = self
            .client
            .create_route_table()
            .vpc_id(vpc_id)
            .tag_specifications(tag_spec(ResourceType::RouteTable, stack, logical))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create route table")?;
        let rtb_id = response
            .route_table()
            .and_then(|t| t.route_table_id())
            .context("CreateRouteTable returned no id")?
            .to_string();
        info!(rtb_id, "route table created");
        Ok(rtb_id)
    }

    pub async fn find_route_table(&self, stack: &str, logical: &str) -> Result<Option<RouteTable>> {
        let response = self
            .client
            .describe_route_tables()
            .set_filters(Some(stack_filters(stack, logical)))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe route tables")?;
        Ok(response.route_tables().first().cloned())
    }

    pub async fn describe_route_table(&self, rtb_id: &str) -> Result<Option<RouteTable>> {
        let response = self
            .client
            .describe_route_tables()
            .filters(
                Filter::builder()
                    .name("route-table-id")
                    .values(rtb_id)
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe route table")?;
        Ok(response.route_tables().first().cloned())
    }

    pub async fn delete_route_table(&self, rtb_id: &str) -> Result<()> {
        self.client
            .delete_route_table()
            .route_table_id(rtb_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete route table")?;
        Ok(())
    }

    pub async fn create_route(
        &self,
        rtb_id: &str,
        destination: &str,
        gateway_id: &str,
    ) -> Result<()> {
        self.client
            .create_route()
            .route_table_id(rtb_id)
            .destination_cidr_block(destination)
            .gateway_id(gateway_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create route")?;
        debug!(rtb_id, destination, "route created");
        Ok(())
    }

    pub async fn delete_route(&self, rtb_id: &str, destination: &str) -> Result<()> {
        self.client
            .delete_route()
            .route_table_id(rtb_id)
            .destination_cidr_block(destination)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete route")?;
        Ok(())
    }

    pub async fn associate_route_table(&self, rtb_id: &str, subnet_id: &str) -> Result<String> {
        let response = self
            .client
            .associate_route_table()
            .route_table_id(rtb_id)
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to associate route table")?;
        response
            .association_id()
            .context("AssociateRouteTable returned no association id")
            .map(str::to_string)
    }

    /// Find a subnet association by its association id
    pub async fn describe_association(
        &self,
        association_id: &str,
    ) -> Result<Option<aws_sdk_ec2::types::RouteTableAssociation>> {
        let response = self
            .client
            .describe_route_tables()
            .filters(
                Filter::builder()
                    .name("association.route-table-association-id")
                    .values(association_id)
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe route table association")?;
        Ok(response
            .route_tables()
            .iter()
            .flat_map(|t| t.associations())
            .find(|a| a.route_table_association_id() == Some(association_id))
            .cloned())
    }

    pub async fn disassociate_route_table(&self, association_id: &str) -> Result<()> {
        self.client
            .disassociate_route_table()
            .association_id(association_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to disassociate route table")?;
        Ok(())
    }

    pub async fn create_vpc_endpoint(
        &self,
        stack: &str,
        logical: &str,
        vpc_id: &str,
        region: &str,
        service: &str,
        rtb_id: &str,
    ) -> Result<String> {
        let response = self
            .client
            .create_vpc_endpoint()
            .vpc_id(vpc_id)
            .service_name(format!("com.amazonaws.{region}.{service}"))
            .route_table_ids(rtb_id)
            .tag_specifications(tag_spec(ResourceType::VpcEndpoint, stack, logical))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create VPC endpoint")?;
        let endpoint_id = response
            .vpc_endpoint()
            .and_then(|e| e.vpc_endpoint_id())
            .context("CreateVpcEndpoint returned no id")?
            .to_string();
        info!(endpoint_id, service, "VPC endpoint created");
        Ok(endpoint_id)
    }

    pub async fn find_vpc_endpoint(
        &self,
        stack: &str,
        logical: &str,
    ) -> Result<Option<VpcEndpoint>> {
        let response = self
            .client
            .describe_vpc_endpoints()
            .set_filters(Some(stack_filters(stack, logical)))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe VPC endpoints")?;
        Ok(response.vpc_endpoints().first().cloned())
    }

    pub async fn describe_vpc_endpoint(&self, endpoint_id: &str) -> Result<Option<VpcEndpoint>> {
        let response = self
            .client
            .describe_vpc_endpoints()
            .filters(
                Filter::builder()
                    .name("vpc-endpoint-id")
                    .values(endpoint_id)
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe VPC endpoint")?;
        Ok(response.vpc_endpoints().first().cloned())
    }

    pub async fn delete_vpc_endpoint(&self, endpoint_id: &str) -> Result<()> {
        self.client
            .delete_vpc_endpoints()
            .vpc_endpoint_ids(endpoint_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete VPC endpoint")?;
        Ok(())
    }

    pub async fn create_placement_group(
        &self,
        stack: &str,
        logical: &str,
        name: &str,
        strategy: &str,
    ) -> Result<()> {
        self.client
            .create_placement_group()
            .group_name(name)
            .strategy(PlacementStrategy::from(strategy))
            .tag_specifications(tag_spec(ResourceType::PlacementGroup, stack, logical))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create placement group")?;
        info!(name, strategy, "placement group created");
        Ok(())
    }

    pub async fn find_placement_group(&self, name: &str) -> Result<Option<PlacementGroup>> {
        let response = self
            .client
            .describe_placement_groups()
            .filters(Filter::builder().name("group-name").values(name).build())
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to describe placement groups")?;
        Ok(response.placement_groups().first().cloned())
    }

    pub async fn delete_placement_group(&self, name: &str) -> Result<()> {
        self.client
            .delete_placement_group()
            .group_name(name)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete placement group")?;
        Ok(())
    }
}
