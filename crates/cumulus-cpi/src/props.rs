//! Per-resource configuration structs
//!
//! The request's loosely-typed option hashes are decoded into these structs
//! once, at the orchestrator boundary, and validated there; everything past
//! that point works with named fields and documented defaults.

use crate::error::{CpiError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Most NICs a single VM may carry; also bounds the naming convention used
/// to locate NICs of an already-deleted VM.
pub const MAX_NICS_PER_VM: usize = 4;

/// Disk caching mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Caching {
    None,
    ReadOnly,
    #[default]
    ReadWrite,
}

impl std::fmt::Display for Caching {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Caching::None => write!(f, "None"),
            Caching::ReadOnly => write!(f, "ReadOnly"),
            Caching::ReadWrite => write!(f, "ReadWrite"),
        }
    }
}

impl std::str::FromStr for Caching {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "None" => Ok(Caching::None),
            "ReadOnly" => Ok(Caching::ReadOnly),
            "ReadWrite" => Ok(Caching::ReadWrite),
            other => Err(format!("unknown caching mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Windows,
}

/// One request to create a VM.
#[derive(Debug, Clone, Deserialize)]
pub struct VmSpec {
    /// Logical VM name; sub-resource names derive from it.
    pub name: String,

    /// Stemcell the boot image is resolved from.
    pub stemcell_cid: String,

    #[serde(default)]
    pub props: VmProps,

    pub networks: Vec<NetworkProps>,
}

/// VM-kind configuration with documented defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct VmProps {
    /// Platform instance size, e.g. `Standard_D2s_v3`.
    pub size: String,

    /// Resource group override; the configured default applies when unset.
    #[serde(default)]
    pub resource_group: Option<String>,

    /// Availability grouping to join; created on first use.
    #[serde(default)]
    pub availability_set: Option<String>,

    /// OS disk size in GB. Default 30.
    #[serde(default = "default_os_disk_gb")]
    pub os_disk_gb: u32,

    /// Ephemeral disk size in GB; no ephemeral disk when unset.
    #[serde(default)]
    pub ephemeral_disk_gb: Option<u32>,

    /// Provision a boot-diagnostics storage endpoint.
    #[serde(default)]
    pub diagnostics: bool,

    /// Disk caching mode. Default ReadWrite.
    #[serde(default)]
    pub caching: Caching,

    /// Storage-account hint packed into the instance id.
    #[serde(default)]
    pub storage_account: Option<String>,

    #[serde(default)]
    pub tags: HashMap<String, String>,
}

fn default_os_disk_gb() -> u32 {
    30
}

impl Default for VmProps {
    fn default() -> Self {
        Self {
            size: String::new(),
            resource_group: None,
            availability_set: None,
            os_disk_gb: default_os_disk_gb(),
            ephemeral_disk_gb: None,
            diagnostics: false,
            caching: Caching::default(),
            storage_account: None,
            tags: HashMap::new(),
        }
    }
}

/// One network attachment.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkProps {
    /// Full resource path of the subnet the NIC joins.
    pub subnet_id: String,

    /// Static private address; allocation is dynamic when unset.
    #[serde(default)]
    pub private_ip: Option<String>,

    /// Allocate a new dynamic public address for this NIC.
    #[serde(default)]
    pub public_ip: bool,

    /// Backend address pool of a load balancer to bind into.
    #[serde(default)]
    pub load_balancer_pool_id: Option<String>,
}

/// One request to create a persistent disk.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskProps {
    pub size_gb: u32,

    #[serde(default)]
    pub caching: Caching,
}

impl DiskProps {
    pub fn validate(&self) -> Result<()> {
        if self.size_gb == 0 {
            return Err(CpiError::InvalidConfig("disk size_gb must be positive".to_string()));
        }
        Ok(())
    }
}

/// Resolved boot image, produced by the stemcell resolver collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemcellRef {
    pub uri: String,
    pub os_type: OsType,
    /// Light stemcells reference a platform-published image instead of an
    /// uploaded blob.
    pub is_light: bool,
    pub image_size_gb: u32,
}

impl VmSpec {
    /// Validate once at the orchestrator boundary.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CpiError::InvalidConfig("vm name is empty".to_string()));
        }
        if self.stemcell_cid.is_empty() {
            return Err(CpiError::InvalidConfig("stemcell_cid is empty".to_string()));
        }
        if self.props.size.is_empty() {
            return Err(CpiError::InvalidConfig("vm size is empty".to_string()));
        }
        if self.networks.is_empty() {
            return Err(CpiError::InvalidConfig(
                "at least one network is required".to_string(),
            ));
        }
        if self.networks.len() > MAX_NICS_PER_VM {
            return Err(CpiError::InvalidConfig(format!(
                "{} networks requested, at most {MAX_NICS_PER_VM} supported",
                self.networks.len()
            )));
        }
        if self.props.os_disk_gb == 0 {
            return Err(CpiError::InvalidConfig("os_disk_gb must be positive".to_string()));
        }
        for network in &self.networks {
            if network.subnet_id.is_empty() {
                return Err(CpiError::InvalidConfig("network subnet_id is empty".to_string()));
            }
            if let Some(ip) = &network.private_ip
                && ip.parse::<std::net::IpAddr>().is_err()
            {
                return Err(CpiError::InvalidConfig(format!(
                    "static private ip {ip:?} is not a valid address"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec() -> VmSpec {
        serde_json::from_value(serde_json::json!({
            "name": "vm-1",
            "stemcell_cid": "stemcell-abc",
            "props": { "size": "Standard_D2s_v3" },
            "networks": [ { "subnet_id": "/subscriptions/s/…/subnets/default" } ]
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_apply() {
        let spec = minimal_spec();
        assert_eq!(spec.props.os_disk_gb, 30);
        assert_eq!(spec.props.caching, Caching::ReadWrite);
        assert!(!spec.props.diagnostics);
        assert!(spec.props.availability_set.is_none());
        spec.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_static_ip() {
        let mut spec = minimal_spec();
        spec.networks[0].private_ip = Some("not-an-ip".to_string());
        assert!(matches!(spec.validate(), Err(CpiError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation_rejects_empty_networks() {
        let mut spec = minimal_spec();
        spec.networks.clear();
        assert!(matches!(spec.validate(), Err(CpiError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation_bounds_nic_count() {
        let mut spec = minimal_spec();
        let network = spec.networks[0].clone();
        spec.networks = vec![network; MAX_NICS_PER_VM + 1];
        assert!(matches!(spec.validate(), Err(CpiError::InvalidConfig(_))));
    }
}
