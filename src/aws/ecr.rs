//! ECR image registries
//!
//! One repository per image the stack runs. Each carries a lifecycle rule
//! expiring untagged images after a configured number of days; tagged
//! images are kept indefinitely.

use crate::aws::context::AwsContext;
use crate::aws::error::{classify_anyhow_error, sdk_error, AwsError};
use anyhow::{Context, Result};
use aws_sdk_ecr::types::Repository;
use aws_sdk_ecr::Client;
use tracing::info;

pub struct EcrClient {
    client: Client,
}

impl EcrClient {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.ecr_client(),
        }
    }

    /// Create a repository and return (arn, uri)
    pub async fn create_repository(&self, name: &str) -> Result<(String, String)> {
        let response = self
            .client
            .create_repository()
            .repository_name(name)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create repository")?;
        let repo = response
            .repository()
            .context("CreateRepository returned no repository")?;
        let arn = repo
            .repository_arn()
            .context("repository has no ARN")?
            .to_string();
        let uri = repo
            .repository_uri()
            .context("repository has no URI")?
            .to_string();
        info!(name, uri, "repository created");
        Ok((arn, uri))
    }

    /// Attach the untagged-expiry lifecycle rule
    pub async fn put_untagged_expiry(&self, name: &str, days: i64) -> Result<()> {
        let policy = untagged_expiry_policy(days);
        self.client
            .put_lifecycle_policy()
            .repository_name(name)
            .lifecycle_policy_text(policy)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to put lifecycle policy")?;
        Ok(())
    }

    pub async fn describe_repository(&self, name: &str) -> Result<Option<Repository>> {
        let result = self
            .client
            .describe_repositories()
            .repository_names(name)
            .send()
            .await;
        match result {
            Ok(response) => Ok(response.repositories().first().cloned()),
            Err(err) => {
                let err = sdk_error(err).context("failed to describe repository");
                if classify_anyhow_error(&err) == AwsError::NotFound {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// The configured untagged-expiry window, if a lifecycle policy is set
    pub async fn untagged_retention_days(&self, name: &str) -> Result<Option<i64>> {
        let result = self
            .client
            .get_lifecycle_policy()
            .repository_name(name)
            .send()
            .await;
        let text = match result {
            Ok(response) => match response.lifecycle_policy_text() {
                Some(text) => text.to_string(),
                None => return Ok(None),
            },
            Err(err) => {
                let err = sdk_error(err).context("failed to get lifecycle policy");
                if classify_anyhow_error(&err) == AwsError::NotFound {
                    return Ok(None);
                }
                return Err(err);
            }
        };

        let parsed: serde_json::Value =
            serde_json::from_str(&text).context("lifecycle policy is not valid JSON")?;
        Ok(parsed["rules"][0]["selection"]["countNumber"].as_i64())
    }

    /// Delete a repository. Not forced: a repository still holding images
    /// surfaces as a dependency violation instead of silently losing them.
    pub async fn delete_repository(&self, name: &str) -> Result<()> {
        self.client
            .delete_repository()
            .repository_name(name)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete repository")?;
        info!(name, "repository deleted");
        Ok(())
    }
}

fn untagged_expiry_policy(days: i64) -> String {
    serde_json::json!({
        "rules": [
            {
                "rulePriority": 1,
                "description": format!("expire untagged images after {days} day(s)"),
                "selection": {
                    "tagStatus": "untagged",
                    "countType": "sinceImagePushed",
                    "countUnit": "days",
                    "countNumber": days
                },
                "action": { "type": "expire" }
            }
        ]
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_policy_targets_untagged_only() {
        let policy: serde_json::Value =
            serde_json::from_str(&untagged_expiry_policy(1)).unwrap();
        let rule = &policy["rules"][0];
        assert_eq!(rule["selection"]["tagStatus"], "untagged");
        assert_eq!(rule["selection"]["countNumber"], 1);
        assert_eq!(rule["action"]["type"], "expire");
    }
}
