//! CPI process configuration
//!
//! One JSON file carries everything the process needs: platform
//! credentials, the lock directory shared with sibling CPI processes, the
//! orchestrator bounds and the stemcell catalog.

use crate::error::{CpiError, Result};
use crate::orchestrator::OrchestratorConfig;
use crate::props::StemcellRef;
use cumulus_arm::ArmConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct CpiConfig {
    pub arm: ArmConfig,

    /// Directory holding the lock files shared across CPI processes.
    pub lock_dir: PathBuf,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Stemcell cid to image-reference catalog.
    #[serde(default)]
    pub stemcells: HashMap<String, StemcellRef>,
}

impl CpiConfig {
    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            CpiError::InvalidConfig(format!("cannot read {}: {err}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|err| {
            CpiError::InvalidConfig(format!("cannot parse {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("arm.subscription_id", &self.arm.subscription_id),
            ("arm.tenant_id", &self.arm.tenant_id),
            ("arm.client_id", &self.arm.client_id),
            ("arm.client_secret", &self.arm.client_secret),
            ("arm.default_resource_group", &self.arm.default_resource_group),
            ("arm.location", &self.arm.location),
        ] {
            if value.is_empty() {
                return Err(CpiError::InvalidConfig(format!("{field} is empty")));
            }
        }
        if self.lock_dir.as_os_str().is_empty() {
            return Err(CpiError::InvalidConfig("lock_dir is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "arm": {
                "subscription_id": "sub-1",
                "tenant_id": "tenant-1",
                "client_id": "client-1",
                "client_secret": "secret",
                "default_resource_group": "rg-default",
                "location": "westeurope"
            },
            "lock_dir": "/var/vcap/data/cpi/locks"
        })
    }

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config: CpiConfig = serde_json::from_value(minimal_json()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.orchestrator.create_retries, 2);
        assert_eq!(config.orchestrator.lock_ttl_secs, 180);
        assert_eq!(config.orchestrator.max_data_disks, 64);
        assert!(!config.orchestrator.keep_failed_vms);
        assert!(config.stemcells.is_empty());
    }

    #[test]
    fn test_empty_credential_rejected() {
        let mut json = minimal_json();
        json["arm"]["client_secret"] = serde_json::json!("");
        let config: CpiConfig = serde_json::from_value(json).unwrap();
        assert!(matches!(config.validate(), Err(CpiError::InvalidConfig(_))));
    }
}
