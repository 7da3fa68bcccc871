//! Serving reads from the local informer cache
//!
//! GETs for cacheable kinds are answered locally. Anything the cache cannot
//! answer exactly is forwarded, so a miss only ever costs a round trip.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionResource;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{
    json_response, matches_skip_pattern, status_response, Context, Handler, ProxyBody,
    DEFAULT_SKIP_PATTERNS,
};
use crate::cache::ObjectCache;
use crate::discovery::RestMapping;
use crate::metrics::prometheus::CACHE_RESPONSES;
use crate::owner::{
    extract_owner, NamespacedOwnerReference, PRIMARY_RESOURCE_ANNOTATION,
    PRIMARY_RESOURCE_TYPE_ANNOTATION,
};
use crate::requestinfo::{selector_as_equality_map, ListOptions, RequestInfo};

/// Answers cacheable GETs from an [`ObjectCache`]
pub struct CacheResponse {
    next: Arc<dyn Handler>,
    ctx: Arc<Context>,
    cache: Arc<dyn ObjectCache>,
    owner_injection: bool,
    skip_patterns: Vec<String>,
}

/// What a cacheable read asks for
enum Read {
    Get { name: String },
    List { labels: BTreeMap<String, String>, name: Option<String> },
}

impl CacheResponse {
    pub fn new(
        next: Arc<dyn Handler>,
        ctx: Arc<Context>,
        cache: Arc<dyn ObjectCache>,
        owner_injection: bool,
    ) -> Self {
        Self {
            next,
            ctx,
            cache,
            owner_injection,
            skip_patterns: DEFAULT_SKIP_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Replace the paths that always bypass the cache
    pub fn with_skip_patterns(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.skip_patterns = patterns.into_iter().collect();
        self
    }

    fn skipped(&self, target: &str) -> bool {
        self.skip_patterns
            .iter()
            .any(|pattern| matches_skip_pattern(pattern, target))
    }

    /// The cached answer, or None when the request must go upstream
    async fn respond(&self, req: &Request<Bytes>, info: &RequestInfo) -> Option<Value> {
        if !info.is_resource_request {
            return None;
        }

        let gvr = GroupVersionResource::gvr(&info.api_group, &info.api_version, &info.resource);
        let mapping = match self.ctx.mapper.resource_for(&gvr).await {
            Ok(mapping) => mapping,
            Err(e) => {
                debug!(error = %e, resource = %info.resource, "Unable to map resource, forwarding");
                return None;
            }
        };

        let owner = match extract_owner(req.headers()) {
            Ok(owner) => owner,
            Err(e) => {
                debug!(error = %e, "Could not get owner, forwarding");
                return None;
            }
        };
        if let Some(owner) = &owner {
            if let Some(entry) = self.ctx.controllers.get(&owner.gvk()) {
                if entry.is_blacklisted(&mapping.gvk) {
                    debug!(kind = %mapping.gvk.kind, "Skipping cache lookup for blacklisted kind");
                    return None;
                }
            }
        }

        if !info.subresource.is_empty()
            || !matches!(info.verb.as_str(), "get" | "list")
            || !self.ctx.is_watched(&info.namespace)
        {
            return None;
        }

        match self.ctx.api_resources.is_virtual(&mapping.gvk).await {
            Ok(false) => {}
            Ok(true) => {
                debug!(kind = %mapping.gvk.kind, "Virtual resource, must ask the cluster API");
                return None;
            }
            Err(e) => {
                warn!(error = %e, kind = %mapping.gvk.kind, "Unable to determine if resource is virtual");
                return None;
            }
        }

        let read = cacheable_read(info, req.uri().query())?;
        let resource = mapping.api_resource();
        let objects = match &read {
            Read::Get { name } => {
                match self.cache.get(&resource, &info.namespace, name).await {
                    Ok(Some(obj)) => vec![obj],
                    Ok(None) => {
                        debug!(kind = %mapping.gvk.kind, name = %name, "Object not in cache");
                        return None;
                    }
                    Err(e) => {
                        info!(error = %e, kind = %mapping.gvk.kind, "Cache read failed, forwarding");
                        return None;
                    }
                }
            }
            Read::List { labels, name } => match self.cache.list(&resource, &info.namespace).await {
                Ok(objects) => objects
                    .into_iter()
                    .filter(|obj| selected(obj, labels, name.as_deref()))
                    .collect(),
                Err(e) => {
                    info!(error = %e, kind = %mapping.gvk.kind, "Cache list failed, forwarding");
                    return None;
                }
            },
        };

        if self.owner_injection {
            if let Some(owner) = &owner {
                self.recover_dependent_watches(owner, &mapping, &objects).await;
            }
        }

        let items: Vec<Value> = objects
            .iter()
            .filter_map(|obj| render(obj, &resource))
            .collect();
        match read {
            Read::Get { .. } => items.into_iter().next(),
            Read::List { .. } => Some(json!({
                "apiVersion": resource.api_version,
                "kind": format!("{}List", resource.kind),
                "metadata": { "resourceVersion": "" },
                "items": items,
            })),
        }
    }

    /// Re-register watches for dependents the owner already has, so they
    /// are observed again after a restart
    async fn recover_dependent_watches(
        &self,
        owner: &NamespacedOwnerReference,
        mapping: &RestMapping,
        objects: &[Arc<DynamicObject>],
    ) {
        for obj in objects {
            let owned = obj
                .owner_references()
                .iter()
                .any(|reference| owner.matches(reference));
            let annotated = obj.annotations().get(PRIMARY_RESOURCE_ANNOTATION)
                == Some(&owner.namespaced_name())
                && obj.annotations().get(PRIMARY_RESOURCE_TYPE_ANNOTATION)
                    == Some(&owner.group_kind().to_string());

            for use_owner_ref in [owned.then_some(true), annotated.then_some(false)]
                .into_iter()
                .flatten()
            {
                if let Err(e) = self
                    .ctx
                    .registrar
                    .register(owner, &mapping.gvk, use_owner_ref)
                    .await
                {
                    warn!(
                        error = %e,
                        kind = %mapping.gvk.kind,
                        name = %obj.name_any(),
                        "Failed to recover dependent watch"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Handler for CacheResponse {
    async fn handle(&self, req: Request<Bytes>) -> Response<ProxyBody> {
        if req.method() != Method::GET {
            return self.next.handle(req).await;
        }

        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| req.uri().path());
        if self.skipped(target) {
            debug!(path = %target, "Path matches a skip pattern, forwarding");
            CACHE_RESPONSES.with_label_values(&["skipped"]).inc();
            return self.next.handle(req).await;
        }

        let info = match self.ctx.factory.from_request(&req) {
            Ok(info) => info,
            Err(e) => {
                return status_response(
                    StatusCode::BAD_REQUEST,
                    format!("failed to convert request: {}", e),
                )
            }
        };

        match self.respond(&req, &info).await {
            Some(body) => {
                debug!(path = %info.path, "Served from cache");
                CACHE_RESPONSES.with_label_values(&["hit"]).inc();
                json_response(&body)
            }
            None => {
                CACHE_RESPONSES.with_label_values(&["forwarded"]).inc();
                self.next.handle(req).await
            }
        }
    }
}

/// The read a request makes when the cache can answer it exactly
fn cacheable_read(info: &RequestInfo, query: Option<&str>) -> Option<Read> {
    if info.verb == "get" {
        return Some(Read::Get {
            name: info.name.clone(),
        });
    }

    let options = match ListOptions::from_query(query) {
        Ok(options) => options,
        Err(e) => {
            debug!(error = %e, "Unable to decode list options, forwarding");
            return None;
        }
    };

    let name = match &options.field_selector {
        Some(selector) if selector.is_empty() => None,
        Some(selector) if selector.is_name_only() => selector
            .requires_exact_match("metadata.name")
            .map(str::to_string),
        Some(_) => {
            debug!("Field selector other than metadata.name, forwarding");
            return None;
        }
        None => None,
    };

    let labels = match options.label_selector.as_deref() {
        Some(selector) => match selector_as_equality_map(selector) {
            Ok(labels) => labels,
            Err(e) => {
                debug!(error = %e, "Label selector is not equality only, forwarding");
                return None;
            }
        },
        None => BTreeMap::new(),
    };

    Some(Read::List { labels, name })
}

fn selected(obj: &DynamicObject, labels: &BTreeMap<String, String>, name: Option<&str>) -> bool {
    let object_labels = obj.labels();
    labels
        .iter()
        .all(|(key, value)| object_labels.get(key) == Some(value))
        && name.map_or(true, |name| obj.name_any() == name)
}

/// JSON of a cached object, with its type filled in when the list it came
/// from omitted it
fn render(obj: &DynamicObject, resource: &ApiResource) -> Option<Value> {
    let mut value = match serde_json::to_value(obj) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Could not serialize cached object");
            return None;
        }
    };
    if let Some(map) = value.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| Value::String(resource.api_version.clone()));
        map.entry("kind")
            .or_insert_with(|| Value::String(resource.kind.clone()));
    }
    Some(value)
}
