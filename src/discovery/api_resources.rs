//! Cache of discovered resource capabilities
//!
//! A kind is virtual when it cannot be listed, watched and fetched, so it
//! can neither be served from an informer cache nor watched as a dependent.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;
use kube::core::GroupVersionKind;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{gvk_key, parse_group_version, DiscoveryClient};
use crate::metrics::prometheus::DISCOVERY_REFRESHES;
use crate::{Error, Result};

/// Verbs a kind needs to be cacheable and watchable
const REQUIRED_VERBS: [&str; 3] = ["watch", "get", "list"];

/// Discovered resources keyed by `group/version/kind`
pub struct ApiResources {
    client: Arc<dyn DiscoveryClient>,
    resources: RwLock<HashMap<String, APIResource>>,
}

impl ApiResources {
    pub fn new(client: Arc<dyn DiscoveryClient>) -> Self {
        Self {
            client,
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the table with a fresh discovery of the whole server
    pub async fn refresh(&self) -> Result<()> {
        let mut resources = self.resources.write().await;
        self.refresh_locked(&mut resources).await
    }

    async fn refresh_locked(&self, resources: &mut HashMap<String, APIResource>) -> Result<()> {
        let lists = self.client.server_resources().await?;
        DISCOVERY_REFRESHES.with_label_values(&["api_resources"]).inc();

        let mut fresh = HashMap::new();
        for list in lists {
            let (group, version) = parse_group_version(&list.group_version);
            for resource in list.resources {
                // names containing a slash are subresources
                if resource.name.contains('/') {
                    continue;
                }
                let gvk = GroupVersionKind::gvk(&group, &version, &resource.kind);
                fresh.insert(gvk_key(&gvk), resource);
            }
        }

        info!(count = fresh.len(), "Refreshed discovered api resources");
        *resources = fresh;
        Ok(())
    }

    /// Whether `gvk` lacks any of the `watch`, `get` and `list` verbs.
    ///
    /// A miss triggers exactly one refresh; a kind still unknown afterwards
    /// is an error.
    pub async fn is_virtual(&self, gvk: &GroupVersionKind) -> Result<bool> {
        let key = gvk_key(gvk);

        if let Some(resource) = self.resources.read().await.get(&key) {
            return Ok(!supports_all_verbs(resource));
        }

        debug!(kind = %key, "Kind not in discovery cache, refreshing");
        let mut resources = self.resources.write().await;
        if let Some(resource) = resources.get(&key) {
            return Ok(!supports_all_verbs(resource));
        }
        self.refresh_locked(&mut resources).await?;

        resources
            .get(&key)
            .map(|resource| !supports_all_verbs(resource))
            .ok_or(Error::ApiResourceNotFound(key))
    }
}

fn supports_all_verbs(resource: &APIResource) -> bool {
    REQUIRED_VERBS
        .iter()
        .all(|verb| resource.verbs.iter().any(|v| v == verb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
    use tokio::sync::Barrier;

    use crate::discovery::MockDiscoveryClient;

    fn resource(name: &str, kind: &str, verbs: &[&str]) -> APIResource {
        APIResource {
            name: name.to_string(),
            kind: kind.to_string(),
            namespaced: true,
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }
    }

    fn server_resources() -> Vec<APIResourceList> {
        vec![
            APIResourceList {
                group_version: "v1".to_string(),
                resources: vec![
                    resource(
                        "pods",
                        "Pod",
                        &["get", "list", "watch", "create", "update", "delete"],
                    ),
                    resource("pods/exec", "PodExecOptions", &["get", "list", "watch"]),
                ],
            },
            APIResourceList {
                group_version: "metrics.k8s.io/v1beta1".to_string(),
                resources: vec![resource("podmetrics", "PodMetrics", &["get"])],
            },
        ]
    }

    #[tokio::test]
    async fn kind_with_all_verbs_is_not_virtual() {
        let mut client = MockDiscoveryClient::new();
        client
            .expect_server_resources()
            .times(1)
            .returning(|| Ok(server_resources()));
        let resources = ApiResources::new(Arc::new(client));

        let pod = GroupVersionKind::gvk("", "v1", "Pod");
        assert!(!resources.is_virtual(&pod).await.unwrap());
        // second lookup is a cache hit, no further discovery call
        assert!(!resources.is_virtual(&pod).await.unwrap());
    }

    #[tokio::test]
    async fn kind_with_only_get_is_virtual() {
        let mut client = MockDiscoveryClient::new();
        client
            .expect_server_resources()
            .times(1)
            .returning(|| Ok(server_resources()));
        let resources = ApiResources::new(Arc::new(client));

        let metrics = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        assert!(resources.is_virtual(&metrics).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_kind_refreshes_once_then_errors() {
        let mut client = MockDiscoveryClient::new();
        client
            .expect_server_resources()
            .times(1)
            .returning(|| Ok(server_resources()));
        let resources = ApiResources::new(Arc::new(client));

        let unknown = GroupVersionKind::gvk("example.com", "v1", "Widget");
        let err = resources.is_virtual(&unknown).await.unwrap_err();
        assert!(matches!(err, Error::ApiResourceNotFound(_)));
        assert!(err.to_string().contains("unable to get api resource"));
    }

    #[tokio::test]
    async fn subresources_are_not_recorded() {
        let mut client = MockDiscoveryClient::new();
        client
            .expect_server_resources()
            .times(1)
            .returning(|| Ok(server_resources()));
        let resources = ApiResources::new(Arc::new(client));

        let exec = GroupVersionKind::gvk("", "v1", "PodExecOptions");
        assert!(resources.is_virtual(&exec).await.is_err());
    }

    #[tokio::test]
    async fn discovery_failure_propagates() {
        let mut client = MockDiscoveryClient::new();
        client
            .expect_server_resources()
            .times(1)
            .returning(|| Err(Error::DiscoveryError("connection refused".to_string())));
        let resources = ApiResources::new(Arc::new(client));

        let pod = GroupVersionKind::gvk("", "v1", "Pod");
        assert!(matches!(
            resources.is_virtual(&pod).await,
            Err(Error::DiscoveryError(_))
        ));
    }

    /// Discovery that takes a while to answer
    #[derive(Default)]
    struct SlowDiscovery {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DiscoveryClient for SlowDiscovery {
        async fn server_resources(&self) -> Result<Vec<APIResourceList>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(server_resources())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_refresh() {
        let client = Arc::new(SlowDiscovery::default());
        let resources = Arc::new(ApiResources::new(client.clone()));
        let barrier = Arc::new(Barrier::new(8));

        let lookups = (0..8).map(|_| {
            let resources = resources.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                resources
                    .is_virtual(&GroupVersionKind::gvk("", "v1", "Pod"))
                    .await
            })
        });
        for result in futures::future::join_all(lookups).await {
            assert!(!result.unwrap().unwrap());
        }

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_replaces_the_whole_table() {
        let mut client = MockDiscoveryClient::new();
        let mut calls = 0;
        client.expect_server_resources().times(2).returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(server_resources())
            } else {
                Ok(vec![])
            }
        });
        let resources = ApiResources::new(Arc::new(client));

        resources.refresh().await.unwrap();
        let pod = GroupVersionKind::gvk("", "v1", "Pod");
        assert!(!resources.is_virtual(&pod).await.unwrap());

        resources.refresh().await.unwrap();
        assert!(resources.resources.read().await.is_empty());
    }
}
