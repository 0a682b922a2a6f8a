//! IAM roles, policies, and the instance profile
//!
//! The stack's trust chain: a service role for the batch control plane, an
//! instance role carrying the managed policies plus the stack's own
//! job-submission policy, and the instance profile EC2 boots with.

use crate::aws::context::AwsContext;
use crate::aws::error::{classify_anyhow_error, sdk_error, AwsError};
use anyhow::{Context, Result};
use aws_sdk_iam::types::{InstanceProfile, Role, Tag};
use aws_sdk_iam::Client;
use tracing::info;

use super::ec2::{LOGICAL_TAG, STACK_TAG};

pub struct IamClient {
    client: Client,
}

fn tags(stack: &str, logical: &str) -> Result<Vec<Tag>> {
    Ok(vec![
        Tag::builder()
            .key(STACK_TAG)
            .value(stack)
            .build()
            .context("invalid stack tag")?,
        Tag::builder()
            .key(LOGICAL_TAG)
            .value(logical)
            .build()
            .context("invalid logical tag")?,
    ])
}

/// Trust policy allowing `service` to assume the role
fn trust_policy(service: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Principal": { "Service": service },
                "Action": "sts:AssumeRole"
            }
        ]
    })
    .to_string()
}

impl IamClient {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.iam_client(),
        }
    }

    pub async fn create_role(
        &self,
        stack: &str,
        logical: &str,
        name: &str,
        trusted_service: &str,
    ) -> Result<String> {
        let response = self
            .client
            .create_role()
            .role_name(name)
            .assume_role_policy_document(trust_policy(trusted_service))
            .set_tags(Some(tags(stack, logical)?))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create role")?;
        let arn = response
            .role()
            .map(|r| r.arn().to_string())
            .context("CreateRole returned no role")?;
        info!(name, trusted_service, "role created");
        Ok(arn)
    }

    pub async fn get_role(&self, name: &str) -> Result<Option<Role>> {
        match self.client.get_role().role_name(name).send().await {
            Ok(response) => Ok(response.role().cloned()),
            Err(err) => {
                let err = sdk_error(err).context("failed to get role");
                if classify_anyhow_error(&err) == AwsError::NotFound {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()> {
        self.client
            .attach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to attach role policy")?;
        Ok(())
    }

    pub async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()> {
        self.client
            .detach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to detach role policy")?;
        Ok(())
    }

    /// ARNs of every managed policy attached to `role`, sorted
    pub async fn attached_policy_arns(&self, role: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .list_attached_role_policies()
            .role_name(role)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to list attached role policies")?;
        let mut arns: Vec<String> = response
            .attached_policies()
            .iter()
            .filter_map(|p| p.policy_arn().map(str::to_string))
            .collect();
        arns.sort_unstable();
        Ok(arns)
    }

    pub async fn delete_role(&self, name: &str) -> Result<()> {
        // Managed policies must be detached before the role can go
        for arn in self.attached_policy_arns(name).await? {
            self.detach_role_policy(name, &arn).await?;
        }
        self.client
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete role")?;
        info!(name, "role deleted");
        Ok(())
    }

    pub async fn create_policy(
        &self,
        stack: &str,
        logical: &str,
        name: &str,
        document: &str,
    ) -> Result<String> {
        let response = self
            .client
            .create_policy()
            .policy_name(name)
            .policy_document(document)
            .set_tags(Some(tags(stack, logical)?))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create policy")?;
        let arn = response
            .policy()
            .and_then(|p| p.arn())
            .context("CreatePolicy returned no ARN")?
            .to_string();
        info!(name, "policy created");
        Ok(arn)
    }

    pub async fn get_policy(&self, arn: &str) -> Result<Option<aws_sdk_iam::types::Policy>> {
        match self.client.get_policy().policy_arn(arn).send().await {
            Ok(response) => Ok(response.policy().cloned()),
            Err(err) => {
                let err = sdk_error(err).context("failed to get policy");
                if classify_anyhow_error(&err) == AwsError::NotFound {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Document of one policy version, decoded and canonicalized so it
    /// compares equal to the JSON the stack template produces.
    pub async fn policy_version_document(&self, arn: &str, version_id: &str) -> Result<String> {
        let response = self
            .client
            .get_policy_version()
            .policy_arn(arn)
            .version_id(version_id)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to get policy version")?;
        let document = response
            .policy_version()
            .and_then(|v| v.document())
            .unwrap_or_default();
        Ok(canonical_document(&percent_decode(document)))
    }

    /// Replace the policy's document by pushing a new default version.
    ///
    /// IAM caps a policy at five versions, so the oldest non-default one is
    /// pruned first when the cap is reached.
    pub async fn put_policy_document(&self, arn: &str, document: &str) -> Result<()> {
        let versions = self
            .client
            .list_policy_versions()
            .policy_arn(arn)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to list policy versions")?;
        if versions.versions().len() >= 5 {
            let mut non_default: Vec<&str> = versions
                .versions()
                .iter()
                .filter(|v| !v.is_default_version())
                .filter_map(|v| v.version_id())
                .collect();
            non_default.sort_unstable();
            if let Some(oldest) = non_default.first() {
                self.client
                    .delete_policy_version()
                    .policy_arn(arn)
                    .version_id(*oldest)
                    .send()
                    .await
                    .map_err(sdk_error)
                    .context("failed to prune policy version")?;
            }
        }
        self.client
            .create_policy_version()
            .policy_arn(arn)
            .policy_document(document)
            .set_as_default(true)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create policy version")?;
        info!(arn, "policy document replaced");
        Ok(())
    }

    pub async fn delete_policy(&self, arn: &str) -> Result<()> {
        // Non-default versions must go before the policy itself can
        let versions = self
            .client
            .list_policy_versions()
            .policy_arn(arn)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to list policy versions")?;
        for version in versions.versions() {
            if version.is_default_version() {
                continue;
            }
            let Some(version_id) = version.version_id() else {
                continue;
            };
            self.client
                .delete_policy_version()
                .policy_arn(arn)
                .version_id(version_id)
                .send()
                .await
                .map_err(sdk_error)
                .context("failed to delete policy version")?;
        }
        self.client
            .delete_policy()
            .policy_arn(arn)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete policy")?;
        Ok(())
    }

    pub async fn create_instance_profile(
        &self,
        stack: &str,
        logical: &str,
        name: &str,
        role: &str,
    ) -> Result<String> {
        let response = self
            .client
            .create_instance_profile()
            .instance_profile_name(name)
            .set_tags(Some(tags(stack, logical)?))
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to create instance profile")?;
        let arn = response
            .instance_profile()
            .map(|p| p.arn().to_string())
            .context("CreateInstanceProfile returned no profile")?;

        self.client
            .add_role_to_instance_profile()
            .instance_profile_name(name)
            .role_name(role)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to add role to instance profile")?;

        info!(name, role, "instance profile created");
        Ok(arn)
    }

    pub async fn get_instance_profile(&self, name: &str) -> Result<Option<InstanceProfile>> {
        match self
            .client
            .get_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
        {
            Ok(response) => Ok(response.instance_profile().cloned()),
            Err(err) => {
                let err = sdk_error(err).context("failed to get instance profile");
                if classify_anyhow_error(&err) == AwsError::NotFound {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub async fn delete_instance_profile(&self, name: &str) -> Result<()> {
        if let Some(profile) = self.get_instance_profile(name).await? {
            for role in profile.roles() {
                self.client
                    .remove_role_from_instance_profile()
                    .instance_profile_name(name)
                    .role_name(role.role_name())
                    .send()
                    .await
                    .map_err(sdk_error)
                    .context("failed to remove role from instance profile")?;
            }
        }
        self.client
            .delete_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(sdk_error)
            .context("failed to delete instance profile")?;
        info!(name, "instance profile deleted");
        Ok(())
    }
}

/// IAM returns policy documents URL-encoded
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Normalize key order and whitespace through a serde_json round trip
fn canonical_document(document: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(document) {
        Ok(value) => value.to_string(),
        Err(_) => document.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_policy_names_the_service() {
        let doc: serde_json::Value =
            serde_json::from_str(&trust_policy("batch.amazonaws.com")).unwrap();
        assert_eq!(
            doc["Statement"][0]["Principal"]["Service"],
            "batch.amazonaws.com"
        );
        assert_eq!(doc["Statement"][0]["Action"], "sts:AssumeRole");
    }

    #[test]
    fn stored_documents_decode_and_canonicalize() {
        let encoded = "%7B%22Version%22%3A%20%222012-10-17%22%2C%22Statement%22%3A%5B%5D%7D";
        let decoded = percent_decode(encoded);
        assert_eq!(decoded, r#"{"Version": "2012-10-17","Statement":[]}"#);
        assert_eq!(
            canonical_document(&decoded),
            serde_json::json!({"Version": "2012-10-17", "Statement": []}).to_string()
        );
    }

    #[test]
    fn canonicalization_erases_key_order_and_spacing() {
        let a = canonical_document(r#"{ "b": 1, "a": [2, 3] }"#);
        let b = canonical_document(r#"{"a":[2,3],"b":1}"#);
        assert_eq!(a, b);
    }
}
