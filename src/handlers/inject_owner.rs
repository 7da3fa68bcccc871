//! Owner injection into created resources
//!
//! A resource created on behalf of an owner gets an owner reference when
//! both live in the same namespace, or the primary resource annotations
//! otherwise. The child kind is then watched so changes to it re-trigger
//! the owner. An owner that cannot be decoded or resolved leaves the
//! request untouched.

use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH};
use hyper::{Method, Request, Response, StatusCode};
use kube::core::GroupVersionResource;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use super::{status_response, Context, Handler, ProxyBody};
use crate::owner::{
    extract_owner, NamespacedOwnerReference, PRIMARY_RESOURCE_ANNOTATION,
    PRIMARY_RESOURCE_TYPE_ANNOTATION,
};

/// Injects the requesting owner into POSTed objects
pub struct InjectOwner {
    next: Arc<dyn Handler>,
    ctx: Arc<Context>,
}

impl InjectOwner {
    pub fn new(next: Arc<dyn Handler>, ctx: Arc<Context>) -> Self {
        Self { next, ctx }
    }

    async fn inject(&self, req: Request<Bytes>) -> Result<Request<Bytes>, Response<ProxyBody>> {
        let info = self.ctx.factory.from_request(&req).map_err(|e| {
            error!(error = %e, "Failed to convert request");
            status_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to convert request: {}", e),
            )
        })?;

        if !info.subresource.is_empty() {
            debug!(
                resource = %info.resource,
                subresource = %info.subresource,
                "Not injecting owner reference for subresource"
            );
            return Ok(req);
        }

        let owner = match extract_owner(req.headers()) {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                debug!(path = %info.path, "No owner in request, not injecting");
                return Ok(req);
            }
            Err(e) => {
                warn!(error = %e, path = %info.path, "Could not get owner reference, not injecting");
                return Ok(req);
            }
        };

        let gvr = GroupVersionResource::gvr(&info.api_group, &info.api_version, &info.resource);
        let child = match self.ctx.mapper.resource_for(&gvr).await {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, resource = %info.resource, "Failed to get kind for resource, not injecting");
                return Ok(req);
            }
        };
        let owner_mapping = match self.ctx.mapper.mapping_for(&owner.gvk()).await {
            Ok(mapping) => mapping,
            Err(e) => {
                warn!(error = %e, owner = %owner.kind, "Failed to get mapping for owner, not injecting");
                return Ok(req);
            }
        };

        let use_owner_ref =
            child.namespaced && owner_mapping.namespaced && info.namespace == owner.namespace;

        let (mut parts, body) = req.into_parts();
        let mut object: Value = serde_json::from_slice(&body).map_err(|e| {
            status_response(
                StatusCode::BAD_REQUEST,
                format!("could not deserialize request body: {}", e),
            )
        })?;
        set_owner(&mut object, &owner, use_owner_ref)
            .map_err(|message| status_response(StatusCode::BAD_REQUEST, message))?;
        info!(
            kind = %child.gvk.kind,
            owner = %owner.namespaced_name(),
            owner_reference = use_owner_ref,
            "Injected owner into request"
        );

        if self.ctx.is_watched(&info.namespace) {
            match self.ctx.api_resources.is_virtual(&child.gvk).await {
                Ok(false) => {
                    if let Err(e) = self.ctx.registrar.register(&owner, &child.gvk, use_owner_ref).await {
                        warn!(error = %e, kind = %child.gvk.kind, "Failed to watch dependent resource");
                    }
                }
                Ok(true) => debug!(kind = %child.gvk.kind, "Virtual resource, not watching"),
                Err(e) => warn!(error = %e, kind = %child.gvk.kind, "Unable to determine if resource is virtual"),
            }
        }

        let body = Bytes::from(object.to_string());
        parts
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Ok(Request::from_parts(parts, body))
    }
}

#[async_trait]
impl Handler for InjectOwner {
    async fn handle(&self, req: Request<Bytes>) -> Response<ProxyBody> {
        if req.method() != Method::POST {
            return self.next.handle(req).await;
        }
        match self.inject(req).await {
            Ok(req) => self.next.handle(req).await,
            Err(response) => response,
        }
    }
}

/// Record `owner` on a JSON object, as an owner reference or as annotations
fn set_owner(
    object: &mut Value,
    owner: &NamespacedOwnerReference,
    use_owner_ref: bool,
) -> Result<(), String> {
    let object = object
        .as_object_mut()
        .ok_or_else(|| "request body is not a JSON object".to_string())?;
    let metadata = child_object(object, "metadata")?;

    if use_owner_ref {
        let reference = serde_json::to_value(owner.to_owner_reference())
            .map_err(|e| format!("could not encode owner reference: {}", e))?;
        let references = metadata
            .entry("ownerReferences")
            .or_insert_with(|| json!([]));
        if references.is_null() {
            *references = json!([]);
        }
        references
            .as_array_mut()
            .ok_or_else(|| "metadata.ownerReferences is not a list".to_string())?
            .push(reference);
    } else {
        let annotations = child_object(metadata, "annotations")?;
        annotations.insert(
            PRIMARY_RESOURCE_ANNOTATION.to_string(),
            Value::String(owner.namespaced_name()),
        );
        annotations.insert(
            PRIMARY_RESOURCE_TYPE_ANNOTATION.to_string(),
            Value::String(owner.group_kind().to_string()),
        );
    }
    Ok(())
}

/// The object under `key`, created when absent or null
fn child_object<'a>(
    parent: &'a mut Map<String, Value>,
    key: &str,
) -> Result<&'a mut Map<String, Value>, String> {
    let child = parent.entry(key).or_insert_with(|| json!({}));
    if child.is_null() {
        *child = json!({});
    }
    child
        .as_object_mut()
        .ok_or_else(|| format!("{} is not an object", key))
}
