//! Deterministic in-process resource store
//!
//! Backs the engine tests: fabricates provider-shaped identifiers and ARNs,
//! counts every call, keeps an ordered event log for ordering assertions,
//! and supports failure injection and settle-after-N-polls readiness. Delete
//! ordering is enforced the way a real provider would: removing a resource
//! that another live resource still references fails with
//! `DependentResourceExists`.

use super::{LiveResource, RemoteHealth, ResolvedResource, ResolvedValue, ResourceStore, StoreError};
use crate::descriptor::{attr, ResourceKind};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Counters for every store operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub lookups: u32,
    pub creates: u32,
    pub updates: u32,
    pub deletes: u32,
    pub polls: u32,
}

impl CallCounts {
    /// Create plus update calls; zero on a converged re-apply
    pub fn mutations(&self) -> u32 {
        self.creates + self.updates
    }
}

#[derive(Debug, Clone)]
enum FailureMode {
    Rejected,
    TransientTimes(u32),
}

#[derive(Debug, Clone)]
struct StoredResource {
    logical_name: String,
    kind: ResourceKind,
    remote_id: String,
    attributes: BTreeMap<String, String>,
    properties: Vec<(String, ResolvedValue)>,
    /// Health polls remaining before the resource reports ready
    settle_remaining: u32,
    created_at: chrono::DateTime<Utc>,
}

impl StoredResource {
    fn to_live(&self) -> LiveResource {
        LiveResource {
            remote_id: self.remote_id.clone(),
            attributes: self.attributes.clone(),
            properties: self.properties.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Keyed by (stack, logical name), the idempotency key
    resources: HashMap<(String, String), StoredResource>,
    counts: CallCounts,
    /// Ordered operation log, e.g. "create:Vpc", "delete:JobQueue"
    events: Vec<String>,
    fail_create: HashMap<String, FailureMode>,
    /// Health polls before a fresh resource reports ready
    settle_polls: u32,
    /// Out-of-band dependents: (stack, target logical name) -> labels
    external_dependents: HashMap<(String, String), Vec<String>>,
    next_id: u64,
}

/// In-memory `ResourceStore` for tests
#[derive(Default)]
pub struct MemoryStore {
    region: String,
    account: String,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            region: "us-east-1".to_string(),
            account: "123456789012".to_string(),
            inner: Mutex::default(),
        }
    }

    pub fn with_region(region: &str) -> Self {
        Self {
            region: region.to_string(),
            ..Self::new()
        }
    }

    /// Make every health poll report `Creating` `n` times before `Ready`
    pub fn set_settle_polls(&self, n: u32) {
        self.lock().settle_polls = n;
    }

    /// Reject the next create of `logical_name` outright
    pub fn fail_create(&self, logical_name: &str) {
        self.lock()
            .fail_create
            .insert(logical_name.to_string(), FailureMode::Rejected);
    }

    /// Fail the next `times` creates of `logical_name` transiently
    pub fn fail_create_transient(&self, logical_name: &str, times: u32) {
        self.lock()
            .fail_create
            .insert(logical_name.to_string(), FailureMode::TransientTimes(times));
    }

    /// Attach an out-of-band dependent to a managed resource, simulating a
    /// resource created outside the stack that still points at it.
    pub fn pin_external_dependent(&self, stack: &str, target_logical_name: &str, label: &str) {
        self.lock()
            .external_dependents
            .entry((stack.to_string(), target_logical_name.to_string()))
            .or_default()
            .push(label.to_string());
    }

    pub fn counts(&self) -> CallCounts {
        self.lock().counts
    }

    /// Ordered operation log for ordering assertions
    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub fn live_count(&self, stack: &str) -> usize {
        self.lock()
            .resources
            .keys()
            .filter(|(s, _)| s == stack)
            .count()
    }

    pub fn contains(&self, stack: &str, logical_name: &str) -> bool {
        self.lock()
            .resources
            .contains_key(&(stack.to_string(), logical_name.to_string()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }

    fn fabricate(&self, inner: &mut Inner, resource: &ResolvedResource) -> StoredResource {
        inner.next_id += 1;
        let n = inner.next_id;
        let name = resource
            .property("name")
            .and_then(ResolvedValue::as_str)
            .unwrap_or(&resource.logical_name)
            .to_string();

        let remote_id = match resource.kind {
            ResourceKind::Vpc => format!("vpc-{n:08x}"),
            ResourceKind::Subnet => format!("subnet-{n:08x}"),
            ResourceKind::SecurityGroup => format!("sg-{n:08x}"),
            ResourceKind::SecurityGroupIngress => format!("sgr-{n:08x}"),
            ResourceKind::InternetGateway => format!("igw-{n:08x}"),
            ResourceKind::GatewayAttachment => format!("igw-att-{n:08x}"),
            ResourceKind::RouteTable => format!("rtb-{n:08x}"),
            ResourceKind::Route => format!("r-{n:08x}"),
            ResourceKind::SubnetRouteTableAssociation => format!("rtbassoc-{n:08x}"),
            ResourceKind::VpcEndpoint => format!("vpce-{n:08x}"),
            ResourceKind::PlacementGroup => format!("pg-{n:08x}"),
            // Named kinds address by physical name, like the real provider
            _ => name.clone(),
        };

        let (region, account) = (&self.region, &self.account);
        let mut attributes = BTreeMap::new();
        attributes.insert(attr::ID.to_string(), remote_id.clone());
        attributes.insert(attr::NAME.to_string(), name.clone());
        match resource.kind {
            ResourceKind::Repository => {
                attributes.insert(
                    attr::ARN.to_string(),
                    format!("arn:aws:ecr:{region}:{account}:repository/{name}"),
                );
                attributes.insert(
                    attr::URI.to_string(),
                    format!("{account}.dkr.ecr.{region}.amazonaws.com/{name}"),
                );
            }
            ResourceKind::Role => {
                attributes.insert(
                    attr::ARN.to_string(),
                    format!("arn:aws:iam::{account}:role/{name}"),
                );
            }
            ResourceKind::ManagedPolicy => {
                attributes.insert(
                    attr::ARN.to_string(),
                    format!("arn:aws:iam::{account}:policy/{name}"),
                );
            }
            ResourceKind::InstanceProfile => {
                attributes.insert(
                    attr::ARN.to_string(),
                    format!("arn:aws:iam::{account}:instance-profile/{name}"),
                );
            }
            ResourceKind::ComputeEnvironment => {
                attributes.insert(
                    attr::ARN.to_string(),
                    format!("arn:aws:batch:{region}:{account}:compute-environment/{name}"),
                );
            }
            ResourceKind::JobQueue => {
                attributes.insert(
                    attr::ARN.to_string(),
                    format!("arn:aws:batch:{region}:{account}:job-queue/{name}"),
                );
            }
            ResourceKind::JobDefinition => {
                attributes.insert(
                    attr::ARN.to_string(),
                    format!("arn:aws:batch:{region}:{account}:job-definition/{name}:1"),
                );
            }
            _ => {}
        }

        StoredResource {
            logical_name: resource.logical_name.clone(),
            kind: resource.kind,
            remote_id,
            attributes,
            properties: resource.properties.clone(),
            settle_remaining: inner.settle_polls,
            created_at: Utc::now(),
        }
    }
}

/// True if `value` contains `needle` as a string anywhere
fn value_contains(value: &ResolvedValue, needle: &str) -> bool {
    match value {
        ResolvedValue::Str(s) => s == needle,
        ResolvedValue::List(items) => items.iter().any(|item| value_contains(item, needle)),
        _ => false,
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn lookup(
        &self,
        stack: &str,
        logical_name: &str,
        _kind: ResourceKind,
    ) -> Result<Option<LiveResource>, StoreError> {
        let mut inner = self.lock();
        inner.counts.lookups += 1;
        Ok(inner
            .resources
            .get(&(stack.to_string(), logical_name.to_string()))
            .map(StoredResource::to_live))
    }

    async fn create(
        &self,
        stack: &str,
        resource: &ResolvedResource,
    ) -> Result<LiveResource, StoreError> {
        let mut inner = self.lock();
        inner.counts.creates += 1;
        inner.events.push(format!("create:{}", resource.logical_name));

        match inner.fail_create.get_mut(&resource.logical_name) {
            Some(FailureMode::Rejected) => {
                return Err(StoreError::Rejected(format!(
                    "injected failure creating '{}'",
                    resource.logical_name
                )));
            }
            Some(FailureMode::TransientTimes(remaining)) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Transient(format!(
                        "injected transient failure creating '{}'",
                        resource.logical_name
                    )));
                }
            }
            None => {}
        }

        let key = (stack.to_string(), resource.logical_name.clone());
        if let Some(existing) = inner.resources.get(&key) {
            // Idempotent: an interrupted apply already created this one
            return Ok(existing.to_live());
        }

        let stored = self.fabricate(&mut inner, resource);
        let live = stored.to_live();
        inner.resources.insert(key, stored);
        Ok(live)
    }

    async fn update(
        &self,
        stack: &str,
        live: &LiveResource,
        resource: &ResolvedResource,
    ) -> Result<LiveResource, StoreError> {
        let mut inner = self.lock();
        inner.counts.updates += 1;
        inner.events.push(format!("update:{}", resource.logical_name));

        let key = (stack.to_string(), resource.logical_name.clone());
        let Some(stored) = inner.resources.get_mut(&key) else {
            return Err(StoreError::NotFound);
        };
        if stored.remote_id != live.remote_id {
            return Err(StoreError::Rejected(format!(
                "stale remote id for '{}'",
                resource.logical_name
            )));
        }
        stored.properties = resource.properties.clone();
        Ok(stored.to_live())
    }

    async fn health(
        &self,
        stack: &str,
        _kind: ResourceKind,
        remote_id: &str,
    ) -> Result<RemoteHealth, StoreError> {
        let mut inner = self.lock();
        inner.counts.polls += 1;

        let stored = inner
            .resources
            .iter_mut()
            .find(|((s, _), r)| s == stack && r.remote_id == remote_id)
            .map(|(_, r)| r);
        match stored {
            Some(resource) if resource.settle_remaining > 0 => {
                resource.settle_remaining -= 1;
                Ok(RemoteHealth::Creating)
            }
            Some(_) => Ok(RemoteHealth::Ready),
            None => Ok(RemoteHealth::Gone),
        }
    }

    async fn delete(
        &self,
        stack: &str,
        kind: ResourceKind,
        remote_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.counts.deletes += 1;

        let Some(key) = inner
            .resources
            .iter()
            .find(|((s, _), r)| s == stack && r.kind == kind && r.remote_id == remote_id)
            .map(|(key, _)| key.clone())
        else {
            inner.events.push(format!("delete:?{remote_id}"));
            return Err(StoreError::NotFound);
        };

        // Refuse deletion while anything still points at this resource
        let target_values: Vec<String> = inner.resources[&key]
            .attributes
            .values()
            .cloned()
            .collect();
        let mut dependents: Vec<String> = inner
            .resources
            .iter()
            .filter(|((s, name), _)| s == stack && *name != key.1)
            .filter(|(_, other)| {
                other.properties.iter().any(|(_, value)| {
                    target_values.iter().any(|needle| value_contains(value, needle))
                })
            })
            .map(|(_, other)| other.logical_name.clone())
            .collect();
        if let Some(external) = inner
            .external_dependents
            .get(&(stack.to_string(), key.1.clone()))
        {
            dependents.extend(external.iter().cloned());
        }
        if !dependents.is_empty() {
            dependents.sort_unstable();
            return Err(StoreError::DependentResourceExists { dependents });
        }

        let logical_name = key.1.clone();
        inner.resources.remove(&key);
        inner.events.push(format!("delete:{logical_name}"));
        Ok(())
    }
}
