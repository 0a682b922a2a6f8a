//! Shared AWS configuration
//!
//! One `SdkConfig` is loaded per process and shared by every service
//! client. The caller's account id is resolved once via STS; registry URIs
//! and IAM ARNs are derived from it.

use crate::aws::error::sdk_error;
use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region, SdkConfig};
use tracing::debug;

/// Loaded AWS configuration plus the resolved caller identity
#[derive(Debug, Clone)]
pub struct AwsContext {
    config: SdkConfig,
    region: String,
    account_id: String,
}

impl AwsContext {
    /// Load credentials and configuration from the environment and resolve
    /// the caller's account id.
    pub async fn new(region: &str) -> Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        let sts = aws_sdk_sts::Client::new(&config);
        let identity = sts
            .get_caller_identity()
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to resolve caller identity")?;
        let account_id = identity
            .account()
            .context("caller identity carries no account id")?
            .to_string();
        debug!(region, account_id, "AWS context loaded");

        Ok(Self {
            config,
            region: region.to_string(),
            account_id,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn ec2_client(&self) -> aws_sdk_ec2::Client {
        aws_sdk_ec2::Client::new(&self.config)
    }

    pub fn ecr_client(&self) -> aws_sdk_ecr::Client {
        aws_sdk_ecr::Client::new(&self.config)
    }

    pub fn iam_client(&self) -> aws_sdk_iam::Client {
        aws_sdk_iam::Client::new(&self.config)
    }

    pub fn batch_client(&self) -> aws_sdk_batch::Client {
        aws_sdk_batch::Client::new(&self.config)
    }
}
