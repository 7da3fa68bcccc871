//! Shared fakes for the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, AUTHORIZATION};
use hyper::{Method, Request, Response};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIResource, APIResourceList};
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use serde_json::Value;
use tokio::sync::broadcast;

use operator_api_proxy::cache::ObjectCache;
use operator_api_proxy::controllermap::{ControllerEntry, InMemoryControllerMap};
use operator_api_proxy::discovery::{ApiResources, DiscoveryClient, DynamicRestMapper};
use operator_api_proxy::handlers::{full, Context, Handler, ProxyBody};
use operator_api_proxy::owner::NamespacedOwnerReference;
use operator_api_proxy::requestinfo::RequestInfoFactory;
use operator_api_proxy::watches::{
    ControllerHandle, DependentWatch, DependentWatchRegistrar, EventSource, Subscription,
};
use operator_api_proxy::Result;

// ============================================================================
// Discovery
// ============================================================================

const ALL_VERBS: &[&str] = &["create", "delete", "get", "list", "patch", "update", "watch"];

fn resource(name: &str, kind: &str, namespaced: bool, verbs: &[&str]) -> APIResource {
    APIResource {
        name: name.to_string(),
        kind: kind.to_string(),
        namespaced,
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// Discovery of a small fixed cluster, counting calls
#[derive(Default)]
pub struct StaticDiscovery {
    calls: AtomicUsize,
}

impl StaticDiscovery {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryClient for StaticDiscovery {
    async fn server_resources(&self) -> Result<Vec<APIResourceList>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            APIResourceList {
                group_version: "v1".to_string(),
                resources: vec![
                    resource("pods", "Pod", true, ALL_VERBS),
                    resource("pods/exec", "PodExecOptions", true, &["create", "get"]),
                    resource("configmaps", "ConfigMap", true, ALL_VERBS),
                    resource("namespaces", "Namespace", false, ALL_VERBS),
                ],
            },
            APIResourceList {
                group_version: "apps/v1".to_string(),
                resources: vec![resource("deployments", "Deployment", true, ALL_VERBS)],
            },
            APIResourceList {
                group_version: "rbac.authorization.k8s.io/v1".to_string(),
                resources: vec![resource("clusterroles", "ClusterRole", false, ALL_VERBS)],
            },
            APIResourceList {
                group_version: "metrics.k8s.io/v1beta1".to_string(),
                resources: vec![resource("pods", "PodMetrics", true, &["get", "list"])],
            },
            APIResourceList {
                group_version: "cache.example.com/v1alpha1".to_string(),
                resources: vec![resource("memcacheds", "Memcached", true, ALL_VERBS)],
            },
        ])
    }
}

// ============================================================================
// Watches
// ============================================================================

/// Records every dependent watch it is asked to start
#[derive(Default)]
pub struct RecordingController {
    watches: Mutex<Vec<(String, &'static str)>>,
}

impl RecordingController {
    /// `(kind, strategy)` of every registration so far
    pub fn watches(&self) -> Vec<(String, &'static str)> {
        self.watches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControllerHandle for RecordingController {
    async fn watch(&self, watch: DependentWatch) -> Result<()> {
        self.watches
            .lock()
            .unwrap()
            .push((watch.resource.kind.clone(), watch.handler.name()));
        Ok(())
    }
}

/// Event source that never emits
pub struct SilentSource;

impl EventSource for SilentSource {
    fn subscribe(&self, _resource: &ApiResource) -> Result<Subscription> {
        let (_, events) = broadcast::channel(1);
        Ok(Subscription {
            events,
            existing: vec![],
        })
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Cache holding a fixed set of objects of any kind
#[derive(Default)]
pub struct FixedCache {
    objects: Vec<Arc<DynamicObject>>,
    reads: AtomicUsize,
}

impl FixedCache {
    pub fn new(objects: Vec<Value>) -> Self {
        Self {
            objects: objects
                .into_iter()
                .map(|v| Arc::new(serde_json::from_value(v).unwrap()))
                .collect(),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn of_kind<'a>(
        &'a self,
        resource: &'a ApiResource,
        namespace: &'a str,
    ) -> impl Iterator<Item = &'a Arc<DynamicObject>> + 'a {
        self.objects.iter().filter(move |obj| {
            obj.types.as_ref().is_some_and(|t| t.kind == resource.kind)
                && (namespace.is_empty() || obj.namespace().as_deref() == Some(namespace))
        })
    }
}

#[async_trait]
impl ObjectCache for FixedCache {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<DynamicObject>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .of_kind(resource, namespace)
            .find(|obj| obj.name_any() == name)
            .cloned())
    }

    async fn list(&self, resource: &ApiResource, namespace: &str) -> Result<Vec<Arc<DynamicObject>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.of_kind(resource, namespace).cloned().collect())
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// A request as seen by the end of the chain
pub struct Seen {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Terminal handler answering `upstream` and remembering what reached it
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn last(&self) -> Seen {
        self.seen.lock().unwrap().pop().unwrap()
    }
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, req: Request<Bytes>) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        self.seen.lock().unwrap().push(Seen {
            method: parts.method,
            uri: parts.uri.to_string(),
            headers: parts.headers,
            body,
        });
        Response::new(full("upstream"))
    }
}

pub async fn body_bytes(response: Response<ProxyBody>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response<ProxyBody>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

// ============================================================================
// Wiring
// ============================================================================

pub fn memcached_owner() -> NamespacedOwnerReference {
    NamespacedOwnerReference {
        group: "cache.example.com".to_string(),
        version: "v1alpha1".to_string(),
        kind: "Memcached".to_string(),
        name: "example".to_string(),
        namespace: "default".to_string(),
        uid: "0f2c9b1e".to_string(),
    }
}

/// Handler context over [`StaticDiscovery`] with one Memcached controller
pub struct Harness {
    pub discovery: Arc<StaticDiscovery>,
    pub controller: Arc<RecordingController>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new(configure: impl FnOnce(ControllerEntry) -> ControllerEntry) -> Self {
        Self::watching(configure, [""])
    }

    pub fn watching<'a>(
        configure: impl FnOnce(ControllerEntry) -> ControllerEntry,
        namespaces: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let discovery = Arc::new(StaticDiscovery::default());
        let controller = Arc::new(RecordingController::default());
        let mapper = Arc::new(DynamicRestMapper::new(discovery.clone()));

        let controllers = Arc::new(InMemoryControllerMap::new());
        controllers.insert(
            memcached_owner().gvk(),
            configure(ControllerEntry::new(controller.clone())),
        );

        let registrar = Arc::new(DependentWatchRegistrar::new(
            mapper.clone(),
            controllers.clone(),
            Arc::new(SilentSource),
        ));
        let ctx = Arc::new(Context {
            factory: RequestInfoFactory::default(),
            mapper,
            api_resources: Arc::new(ApiResources::new(discovery.clone())),
            controllers,
            registrar,
            watched_namespaces: namespaces.into_iter().map(str::to_string).collect::<HashSet<_>>(),
        });

        Self {
            discovery,
            controller,
            ctx,
        }
    }
}

/// A request carrying `owner` as its Basic-Auth identity
pub fn request(
    method: Method,
    uri: &str,
    owner: Option<&NamespacedOwnerReference>,
    body: impl Into<Bytes>,
) -> Request<Bytes> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(owner) = owner {
        builder = builder.header(AUTHORIZATION, owner.basic_auth_header().unwrap());
    }
    builder.body(body.into()).unwrap()
}
