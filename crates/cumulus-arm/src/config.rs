//! Client configuration
//!
//! Retry bounds, poll intervals and the token safety margin are fields with
//! documented defaults, so deployments can tune them without a rebuild.

use serde::Deserialize;
use std::time::Duration;

fn default_api_version() -> String {
    "2024-03-01".to_string()
}

fn default_token_safety_margin_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    5
}

fn default_poll_interval_secs() -> u64 {
    5
}

/// Endpoint base URLs for one platform environment (public cloud,
/// sovereign cloud, on-prem stack).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Environment {
    /// Resource-manager API base, e.g. `https://management.azure.com`.
    pub resource_manager_endpoint: String,

    /// Identity endpoint base used for the client-credentials exchange,
    /// e.g. `https://login.microsoftonline.com`.
    pub identity_endpoint: String,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            resource_manager_endpoint: "https://management.azure.com".to_string(),
            identity_endpoint: "https://login.microsoftonline.com".to_string(),
        }
    }
}

/// Transient-failure and poll tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; a call that keeps failing
    /// transiently is attempted `max_retries + 1` times in total.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Sleep between transient retries when the server sends no
    /// `Retry-After` hint.
    #[serde(default = "default_backoff_secs")]
    pub default_backoff_secs: u64,

    /// Sleep between async-operation polls when the server sends no
    /// `Retry-After` hint.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            default_backoff_secs: default_backoff_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl RetryPolicy {
    pub fn default_backoff(&self) -> Duration {
        Duration::from_secs(self.default_backoff_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Credentials and endpoints for one subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct ArmConfig {
    #[serde(default)]
    pub environment: Environment,

    pub subscription_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Resource group VMs land in unless the request names another.
    pub default_resource_group: String,

    /// Platform region resources are created in.
    pub location: String,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// A cached token within this margin of expiry is treated as expired.
    #[serde(default = "default_token_safety_margin_secs")]
    pub token_safety_margin_secs: u64,
}

impl ArmConfig {
    /// Identity endpoint the client-credentials exchange posts to.
    pub fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/token",
            self.environment.identity_endpoint.trim_end_matches('/'),
            self.tenant_id
        )
    }

    pub fn management_base(&self) -> &str {
        self.environment
            .resource_manager_endpoint
            .trim_end_matches('/')
    }

    pub fn token_safety_margin(&self) -> Duration {
        Duration::from_secs(self.token_safety_margin_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_in() {
        let config: ArmConfig = serde_json::from_value(serde_json::json!({
            "subscription_id": "sub-1",
            "tenant_id": "tenant-1",
            "client_id": "client-1",
            "client_secret": "s3cret",
            "default_resource_group": "rg-default",
            "location": "westus"
        }))
        .unwrap();

        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.token_safety_margin_secs, 60);
        assert_eq!(
            config.token_url(),
            "https://login.microsoftonline.com/tenant-1/oauth2/token"
        );
    }

    #[test]
    fn test_custom_environment() {
        let config: ArmConfig = serde_json::from_value(serde_json::json!({
            "environment": {
                "resource_manager_endpoint": "https://management.local.stack/",
                "identity_endpoint": "https://login.local.stack"
            },
            "subscription_id": "sub-1",
            "tenant_id": "t",
            "client_id": "c",
            "client_secret": "s",
            "default_resource_group": "rg",
            "location": "local"
        }))
        .unwrap();

        assert_eq!(config.management_base(), "https://management.local.stack");
    }
}
