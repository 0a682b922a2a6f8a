//! rios-batch - declarative AWS Batch stack provisioning
//!
//! Builds an isolated batch compute stack (VPC, subnets, security group,
//! image registries, IAM trust chain, placement group, compute environment,
//! job queue, and job definitions) from a declarative resource graph and
//! reconciles it against what actually exists.
//!
//! ## Flow
//!
//! 1. [`params::StackParams`] fix the stack's identity and sizing.
//! 2. [`template::stack_descriptors`] produces the resource graph, which
//!    [`graph::Graph::build`] orders and validates.
//! 3. [`reconciler::Reconciler`] plans the diff against a
//!    [`store::ResourceStore`] and applies it in dependency order, rolling
//!    back this run's creations on failure.
//! 4. [`outputs::resolve`] turns the applied attributes into the output
//!    manifest downstream tooling consumes.
//!
//! The production store is [`aws::AwsStore`]; tests drive the same engine
//! against an in-memory store.

pub mod aws;
pub mod descriptor;
pub mod error;
pub mod graph;
pub mod outputs;
pub mod params;
pub mod plan;
pub mod reconciler;
pub mod rollback;
pub mod store;
pub mod template;
pub mod testing;
pub mod wait;

pub use aws::AwsStore;
pub use error::ProvisionError;
pub use graph::Graph;
pub use outputs::StackOutputs;
pub use params::StackParams;
pub use plan::{ChangeAction, Plan};
pub use reconciler::{ApplyOptions, ApplyReport, Reconciler, Stack};
pub use store::{ResourceStore, StoreError};
pub use wait::ConvergencePolicy;
