//! Versioned resource identifiers
//!
//! A CPI hands the director opaque strings and must later reconstruct, from
//! nothing but that string, everything a call needs: resource group, logical
//! name, caching mode, storage-account hint. The v2 format packs those as
//! `v2;key=value;…` with a fixed key set; a bare string (no `;`, no `=`)
//! parses as the v1 legacy form naming a resource in the default resource
//! group. Parsing fails closed: unknown versions, unknown keys, duplicate or
//! missing fields all reject the whole string.

use crate::error::{CpiError, Result};
use crate::props::Caching;
use std::collections::HashMap;

const VERSION_TAG: &str = "v2";

fn parse_pairs(kind: &'static str, value: &str, body: &str) -> Result<HashMap<String, String>> {
    let mut fields = HashMap::new();
    for pair in body.split(';') {
        let Some((key, val)) = pair.split_once('=') else {
            return Err(invalid(kind, value, format!("malformed pair {pair:?}")));
        };
        if key.is_empty() || val.is_empty() {
            return Err(invalid(kind, value, format!("empty key or value in {pair:?}")));
        }
        if fields.insert(key.to_string(), val.to_string()).is_some() {
            return Err(invalid(kind, value, format!("duplicate key {key:?}")));
        }
    }
    Ok(fields)
}

fn invalid(kind: &'static str, value: &str, reason: String) -> CpiError {
    CpiError::InvalidId {
        kind,
        value: value.to_string(),
        reason,
    }
}

fn take(
    kind: &'static str,
    value: &str,
    fields: &mut HashMap<String, String>,
    key: &str,
) -> Result<String> {
    fields
        .remove(key)
        .ok_or_else(|| invalid(kind, value, format!("missing required field {key:?}")))
}

fn parse_caching(kind: &'static str, value: &str, raw: &str) -> Result<Caching> {
    raw.parse()
        .map_err(|reason: String| invalid(kind, value, reason))
}

/// Identifier of one VM, carrying everything later calls need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceId {
    pub resource_group: String,
    pub vm_name: String,
    pub caching: Caching,
    pub storage_account: Option<String>,
}

impl InstanceId {
    const KIND: &'static str = "instance";

    pub fn new(
        resource_group: impl Into<String>,
        vm_name: impl Into<String>,
        caching: Caching,
        storage_account: Option<String>,
    ) -> Self {
        Self {
            resource_group: resource_group.into(),
            vm_name: vm_name.into(),
            caching,
            storage_account,
        }
    }

    /// Encode into the opaque string handed to the director.
    pub fn serialize(&self) -> String {
        let mut encoded = format!(
            "{VERSION_TAG};caching={};name={};rg={}",
            self.caching, self.vm_name, self.resource_group
        );
        if let Some(account) = &self.storage_account {
            encoded.push_str(&format!(";storage={account}"));
        }
        encoded
    }

    /// Decode an identifier. Bare strings are the v1 legacy form: a VM name
    /// in the default resource group with default caching.
    pub fn parse(value: &str, default_resource_group: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(invalid(Self::KIND, value, "empty id".to_string()));
        }

        let Some(body) = value.strip_prefix(&format!("{VERSION_TAG};")) else {
            if value.contains(';') || value.contains('=') {
                return Err(invalid(
                    Self::KIND,
                    value,
                    "unknown id version".to_string(),
                ));
            }
            return Ok(Self::new(
                default_resource_group,
                value,
                Caching::default(),
                None,
            ));
        };

        let mut fields = parse_pairs(Self::KIND, value, body)?;
        let caching = take(Self::KIND, value, &mut fields, "caching")?;
        let vm_name = take(Self::KIND, value, &mut fields, "name")?;
        let resource_group = take(Self::KIND, value, &mut fields, "rg")?;
        let storage_account = fields.remove("storage");

        if let Some(unknown) = fields.keys().next() {
            return Err(invalid(
                Self::KIND,
                value,
                format!("unknown field {unknown:?}"),
            ));
        }

        Ok(Self {
            resource_group,
            vm_name,
            caching: parse_caching(Self::KIND, value, &caching)?,
            storage_account,
        })
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

/// Identifier of one managed disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskId {
    pub resource_group: String,
    pub disk_name: String,
    pub caching: Caching,
}

impl DiskId {
    const KIND: &'static str = "disk";

    pub fn new(
        resource_group: impl Into<String>,
        disk_name: impl Into<String>,
        caching: Caching,
    ) -> Self {
        Self {
            resource_group: resource_group.into(),
            disk_name: disk_name.into(),
            caching,
        }
    }

    pub fn serialize(&self) -> String {
        format!(
            "{VERSION_TAG};caching={};name={};rg={}",
            self.caching, self.disk_name, self.resource_group
        )
    }

    pub fn parse(value: &str, default_resource_group: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(invalid(Self::KIND, value, "empty id".to_string()));
        }

        let Some(body) = value.strip_prefix(&format!("{VERSION_TAG};")) else {
            if value.contains(';') || value.contains('=') {
                return Err(invalid(Self::KIND, value, "unknown id version".to_string()));
            }
            return Ok(Self::new(default_resource_group, value, Caching::default()));
        };

        let mut fields = parse_pairs(Self::KIND, value, body)?;
        let caching = take(Self::KIND, value, &mut fields, "caching")?;
        let disk_name = take(Self::KIND, value, &mut fields, "name")?;
        let resource_group = take(Self::KIND, value, &mut fields, "rg")?;

        if let Some(unknown) = fields.keys().next() {
            return Err(invalid(
                Self::KIND,
                value,
                format!("unknown field {unknown:?}"),
            ));
        }

        Ok(Self {
            resource_group,
            disk_name,
            caching: parse_caching(Self::KIND, value, &caching)?,
        })
    }
}

impl std::fmt::Display for DiskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.serialize())
    }
}
