//! Typed resource descriptors
//!
//! A `ResourceDescriptor` is the declarative side of one infrastructure
//! object: a kind tag, an ordered property bag, and `Reference`s into other
//! descriptors' attributes. Descriptors are immutable once graph building
//! starts; the reconciler only ever reads them.

use std::fmt;

/// Attribute names a live resource can expose to dependents
pub mod attr {
    pub const ID: &str = "id";
    pub const ARN: &str = "arn";
    pub const NAME: &str = "name";
    pub const URI: &str = "uri";
}

/// Every infrastructure object kind the stack manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Vpc,
    Subnet,
    SecurityGroup,
    SecurityGroupIngress,
    InternetGateway,
    GatewayAttachment,
    RouteTable,
    Route,
    SubnetRouteTableAssociation,
    VpcEndpoint,
    Repository,
    Role,
    ManagedPolicy,
    InstanceProfile,
    PlacementGroup,
    ComputeEnvironment,
    JobQueue,
    JobDefinition,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Vpc => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::SecurityGroupIngress => "security_group_ingress",
            ResourceKind::InternetGateway => "internet_gateway",
            ResourceKind::GatewayAttachment => "gateway_attachment",
            ResourceKind::RouteTable => "route_table",
            ResourceKind::Route => "route",
            ResourceKind::SubnetRouteTableAssociation => "subnet_route_table_association",
            ResourceKind::VpcEndpoint => "vpc_endpoint",
            ResourceKind::Repository => "repository",
            ResourceKind::Role => "role",
            ResourceKind::ManagedPolicy => "managed_policy",
            ResourceKind::InstanceProfile => "instance_profile",
            ResourceKind::PlacementGroup => "placement_group",
            ResourceKind::ComputeEnvironment => "compute_environment",
            ResourceKind::JobQueue => "job_queue",
            ResourceKind::JobDefinition => "job_definition",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed pointer from one descriptor's property into another descriptor's
/// attribute. A lookup dependency resolved at apply time, not an ownership
/// relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Logical name of the referenced descriptor
    pub target: String,
    /// Attribute requested from the referenced live resource
    pub attribute: &'static str,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

/// A value in a descriptor's property bag
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<PropertyValue>),
    Ref(Reference),
}

impl PropertyValue {
    /// A reference to another descriptor's attribute
    pub fn reference(target: impl Into<String>, attribute: &'static str) -> Self {
        PropertyValue::Ref(Reference {
            target: target.into(),
            attribute,
        })
    }

    /// Collect every reference nested in this value
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            PropertyValue::Ref(r) => out.push(r),
            PropertyValue::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            _ => {}
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Str(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

/// One declared infrastructure object
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    /// Logical name, unique within the stack; the idempotency key half that
    /// pairs with the stack identity
    pub logical_name: String,
    pub kind: ResourceKind,
    /// Ordered property bag; order is preserved for stable diffs
    pub properties: Vec<(String, PropertyValue)>,
}

impl ResourceDescriptor {
    pub fn new(logical_name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            logical_name: logical_name.into(),
            kind,
            properties: Vec::new(),
        }
    }

    /// Append a property, keeping declaration order
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// All references this descriptor makes into other descriptors
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        for (_, value) in &self.properties {
            value.collect_references(&mut refs);
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_found_in_nested_lists() {
        let desc = ResourceDescriptor::new("ComputeEnvironment", ResourceKind::ComputeEnvironment)
            .with("max_vcpus", 128)
            .with(
                "subnets",
                PropertyValue::List(vec![
                    PropertyValue::reference("SubnetA", attr::ID),
                    PropertyValue::reference("SubnetB", attr::ID),
                ]),
            )
            .with(
                "security_group",
                PropertyValue::reference("SecurityGroup", attr::ID),
            );

        let refs = desc.references();
        let targets: Vec<&str> = refs.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["SubnetA", "SubnetB", "SecurityGroup"]);
    }

    #[test]
    fn property_lookup_preserves_declaration_order() {
        let desc = ResourceDescriptor::new("Vpc", ResourceKind::Vpc)
            .with("cidr", "10.0.0.0/16")
            .with("dns", true);
        assert_eq!(
            desc.properties.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["cidr", "dns"]
        );
        assert_eq!(
            desc.property("cidr"),
            Some(&PropertyValue::Str("10.0.0.0/16".into()))
        );
        assert!(desc.property("missing").is_none());
    }
}
