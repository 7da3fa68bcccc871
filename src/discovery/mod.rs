//! Live discovery of the resource kinds served by the control plane

pub mod api_resources;
pub mod rest_mapper;

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::core::GroupVersionKind;
use kube::Client;
use tracing::warn;

pub use api_resources::ApiResources;
pub use rest_mapper::{DynamicRestMapper, RestMapper, RestMapping};

use crate::{Error, Result};

/// Source of served resource lists
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Every served group version with its resources
    async fn server_resources(&self) -> Result<Vec<APIResourceList>>;
}

/// Discovery through the kube client
#[derive(Clone)]
pub struct KubeDiscoveryClient {
    client: Client,
}

impl KubeDiscoveryClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DiscoveryClient for KubeDiscoveryClient {
    async fn server_resources(&self) -> Result<Vec<APIResourceList>> {
        let mut lists = Vec::new();

        let core = self
            .client
            .list_core_api_versions()
            .await
            .map_err(|e| Error::DiscoveryError(format!("listing core api versions: {}", e)))?;
        for version in &core.versions {
            match self.client.list_core_api_resources(version).await {
                Ok(list) => lists.push(list),
                Err(e) => warn!(group_version = %version, error = %e, "Skipping undiscoverable group version"),
            }
        }

        let groups = self
            .client
            .list_api_groups()
            .await
            .map_err(|e| Error::DiscoveryError(format!("listing api groups: {}", e)))?;
        for group in &groups.groups {
            for version in &group.versions {
                match self
                    .client
                    .list_api_group_resources(&version.group_version)
                    .await
                {
                    Ok(list) => lists.push(list),
                    Err(e) => warn!(
                        group_version = %version.group_version,
                        error = %e,
                        "Skipping undiscoverable group version"
                    ),
                }
            }
        }

        Ok(lists)
    }
}

/// A kind within a group, printed as `Kind.group`
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Split `group/version` (or a bare core `version`)
pub fn parse_group_version(group_version: &str) -> (String, String) {
    match group_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), group_version.to_string()),
    }
}

/// `group/version/kind` lookup key
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
}
