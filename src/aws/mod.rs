//! AWS backend
//!
//! Thin per-service wrappers over the AWS SDK clients, an error classifier
//! translating SDK failures into store errors, and [`AwsStore`], the live
//! `ResourceStore` the reconciler drives in production.

pub mod batch;
pub mod context;
pub mod ec2;
pub mod ecr;
pub mod error;
pub mod iam;
pub mod store;

pub use context::AwsContext;
pub use error::{classify_anyhow_error, to_store_error, AwsError};
pub use store::AwsStore;
