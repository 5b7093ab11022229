//! Stemcell resolution collaborator
//!
//! Image packaging, blob upload and replication live outside this CPI; the
//! orchestrator only needs a cid to resolve into a bootable image
//! reference.

use crate::error::{CpiError, Result};
use crate::props::StemcellRef;
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait StemcellResolver: Send + Sync {
    async fn resolve(&self, stemcell_cid: &str) -> Result<StemcellRef>;
}

/// Resolver backed by a static catalog from the CPI config file.
pub struct CatalogResolver {
    catalog: HashMap<String, StemcellRef>,
}

impl CatalogResolver {
    pub fn new(catalog: HashMap<String, StemcellRef>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl StemcellResolver for CatalogResolver {
    async fn resolve(&self, stemcell_cid: &str) -> Result<StemcellRef> {
        self.catalog
            .get(stemcell_cid)
            .cloned()
            .ok_or_else(|| CpiError::StemcellNotFound(stemcell_cid.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::OsType;

    #[tokio::test]
    async fn test_catalog_lookup() {
        let image = StemcellRef {
            uri: "https://images/bosh-stemcell-1.vhd".to_string(),
            os_type: OsType::Linux,
            is_light: false,
            image_size_gb: 3,
        };
        let resolver =
            CatalogResolver::new(HashMap::from([("stemcell-1".to_string(), image.clone())]));

        assert_eq!(resolver.resolve("stemcell-1").await.unwrap(), image);
        assert!(matches!(
            resolver.resolve("stemcell-2").await,
            Err(CpiError::StemcellNotFound(_))
        ));
    }
}
