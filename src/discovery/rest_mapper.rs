//! Resource ↔ kind mapping backed by discovery

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::ApiResource;
use kube::core::{GroupVersionKind, GroupVersionResource};
use tokio::sync::RwLock;
use tracing::debug;

use super::{gvk_key, parse_group_version, DiscoveryClient};
use crate::metrics::prometheus::DISCOVERY_REFRESHES;
use crate::{Error, Result};

/// How a kind is served
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestMapping {
    pub gvk: GroupVersionKind,
    /// Plural resource name used in URLs
    pub plural: String,
    pub namespaced: bool,
}

impl RestMapping {
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk, &self.plural)
    }
}

/// Resolves resources to kinds and kinds to their scope
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RestMapper: Send + Sync {
    /// Mapping for the resource named in a request path
    async fn resource_for(&self, gvr: &GroupVersionResource) -> Result<RestMapping>;

    /// Mapping for a kind
    async fn mapping_for(&self, gvk: &GroupVersionKind) -> Result<RestMapping>;
}

#[derive(Default)]
struct MappingTable {
    by_resource: HashMap<String, RestMapping>,
    by_kind: HashMap<String, RestMapping>,
}

/// [`RestMapper`] that rediscovers the server on a miss
pub struct DynamicRestMapper {
    client: Arc<dyn DiscoveryClient>,
    table: RwLock<MappingTable>,
}

impl DynamicRestMapper {
    pub fn new(client: Arc<dyn DiscoveryClient>) -> Self {
        Self {
            client,
            table: RwLock::new(MappingTable::default()),
        }
    }

    async fn refresh(&self, table: &mut MappingTable) -> Result<()> {
        let lists = self.client.server_resources().await?;
        DISCOVERY_REFRESHES.with_label_values(&["rest_mapper"]).inc();

        let mut fresh = MappingTable::default();
        for list in lists {
            let (group, version) = parse_group_version(&list.group_version);
            for resource in list.resources {
                if resource.name.contains('/') {
                    continue;
                }
                let mapping = RestMapping {
                    gvk: GroupVersionKind::gvk(&group, &version, &resource.kind),
                    plural: resource.name.clone(),
                    namespaced: resource.namespaced,
                };
                fresh
                    .by_resource
                    .insert(resource_key(&group, &version, &resource.name), mapping.clone());
                fresh.by_kind.insert(gvk_key(&mapping.gvk), mapping);
            }
        }
        *table = fresh;
        Ok(())
    }

    async fn lookup<F>(&self, key: String, select: F) -> Result<RestMapping>
    where
        F: Fn(&MappingTable) -> &HashMap<String, RestMapping> + Send + Sync,
    {
        if let Some(mapping) = select(&*self.table.read().await).get(&key) {
            return Ok(mapping.clone());
        }

        debug!(key = %key, "No rest mapping cached, refreshing");
        let mut table = self.table.write().await;
        // another miss may have refreshed while we waited for the lock
        if let Some(mapping) = select(&*table).get(&key) {
            return Ok(mapping.clone());
        }
        self.refresh(&mut table).await?;
        select(&*table)
            .get(&key)
            .cloned()
            .ok_or(Error::NoMatch(key))
    }
}

#[async_trait]
impl RestMapper for DynamicRestMapper {
    async fn resource_for(&self, gvr: &GroupVersionResource) -> Result<RestMapping> {
        let key = resource_key(&gvr.group, &gvr.version, &gvr.resource.to_lowercase());
        self.lookup(key, |t| &t.by_resource).await
    }

    async fn mapping_for(&self, gvk: &GroupVersionKind) -> Result<RestMapping> {
        self.lookup(gvk_key(gvk), |t| &t.by_kind).await
    }
}

fn resource_key(group: &str, version: &str, resource: &str) -> String {
    format!("{}/{}/{}", group, version, resource)
}
