//! Resource-manager request paths

/// Provider namespace for compute resources.
pub const PROVIDER_COMPUTE: &str = "Microsoft.Compute";
/// Provider namespace for network resources.
pub const PROVIDER_NETWORK: &str = "Microsoft.Network";
/// Provider namespace for storage resources.
pub const PROVIDER_STORAGE: &str = "Microsoft.Storage";

/// The subscription/resource-group/provider/type/name tuple a request URL is
/// built from. Pure data; equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    pub subscription: String,
    pub resource_group: String,
    pub provider: String,
    pub resource_type: String,
    pub name: String,
}

impl ResourcePath {
    pub fn new(
        subscription: impl Into<String>,
        resource_group: impl Into<String>,
        provider: impl Into<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            resource_group: resource_group.into(),
            provider: provider.into(),
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Path relative to the management endpoint.
    pub fn relative(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}/{}",
            self.subscription, self.resource_group, self.provider, self.resource_type, self.name
        )
    }

    /// Full request URL including the API version.
    pub fn url(&self, base: &str, api_version: &str) -> String {
        format!(
            "{}{}?api-version={}",
            base.trim_end_matches('/'),
            self.relative(),
            api_version
        )
    }

    /// URL for a POST action on the resource (e.g. `restart`).
    pub fn action_url(&self, base: &str, api_version: &str, action: &str) -> String {
        format!(
            "{}{}/{}?api-version={}",
            base.trim_end_matches('/'),
            self.relative(),
            action,
            api_version
        )
    }

    /// URL for the resource group itself (create/inspect).
    pub fn resource_group_url(
        base: &str,
        subscription: &str,
        resource_group: &str,
        api_version: &str,
    ) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}?api-version={}",
            base.trim_end_matches('/'),
            subscription,
            resource_group,
            api_version
        )
    }
}

impl std::fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.relative())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_layout() {
        let path = ResourcePath::new(
            "sub-1",
            "rg-a",
            PROVIDER_COMPUTE,
            "virtualMachines",
            "vm-7",
        );

        assert_eq!(
            path.url("https://management.azure.com/", "2024-03-01"),
            "https://management.azure.com/subscriptions/sub-1/resourceGroups/rg-a\
             /providers/Microsoft.Compute/virtualMachines/vm-7?api-version=2024-03-01"
        );
    }

    #[test]
    fn test_action_url() {
        let path = ResourcePath::new("s", "rg", PROVIDER_COMPUTE, "virtualMachines", "vm");
        assert!(
            path.action_url("https://m", "v1", "restart")
                .ends_with("/virtualMachines/vm/restart?api-version=v1")
        );
    }

    #[test]
    fn test_structural_equality() {
        let a = ResourcePath::new("s", "rg", PROVIDER_NETWORK, "networkInterfaces", "nic");
        let b = ResourcePath::new("s", "rg", PROVIDER_NETWORK, "networkInterfaces", "nic");
        assert_eq!(a, b);
    }
}
