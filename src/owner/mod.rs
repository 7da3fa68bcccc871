//! Owner identity carried in the Basic-Auth username
//!
//! The automation engine authenticates to the proxy with a Basic-Auth
//! username holding base64 encoded JSON of the resource it is acting for.
//! This is a same-process convention, not a security boundary.

use base64::{engine::general_purpose::STANDARD, Engine};
use hyper::header::{HeaderMap, AUTHORIZATION};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::discovery::GroupKind;
use crate::{Error, Result};

/// Annotation naming the owning resource as `namespace/name`
pub const PRIMARY_RESOURCE_ANNOTATION: &str = "operator-sdk/primary-resource";

/// Annotation naming the owning resource type as `Kind.group`
pub const PRIMARY_RESOURCE_TYPE_ANNOTATION: &str = "operator-sdk/primary-resource-type";

/// Identity of the resource a request is issued on behalf of
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedOwnerReference {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Only needed to build a real `metadata.ownerReferences` entry
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

impl NamespacedOwnerReference {
    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(&self.group, &self.kind)
    }

    /// `namespace/name` as stored in the primary resource annotation
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Entry for a dependent's `metadata.ownerReferences`
    pub fn to_owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: None,
            block_owner_deletion: None,
        }
    }

    /// Whether `reference` points at this owner
    pub fn matches(&self, reference: &OwnerReference) -> bool {
        reference.name == self.name
            && reference.kind == self.kind
            && reference.api_version == self.api_version()
    }

    /// Basic-Auth username for this owner
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    /// Complete `Authorization` header value for this owner
    pub fn basic_auth_header(&self) -> Result<String> {
        let credentials = format!("{}:", self.encode()?);
        Ok(format!("Basic {}", STANDARD.encode(credentials)))
    }
}

/// Extract the owner a request was issued for.
///
/// `Ok(None)` when there are no Basic-Auth credentials. An error means the
/// credentials exist but the owner could not be determined, which callers
/// must not confuse with having no owner.
pub fn extract_owner(headers: &HeaderMap) -> Result<Option<NamespacedOwnerReference>> {
    let Some(user) = basic_auth_username(headers) else {
        return Ok(None);
    };

    let decoded = STANDARD.decode(user.as_bytes()).map_err(|e| {
        error!(error = %e, "Could not base64 decode username");
        Error::OwnerReferenceError(format!("could not base64 decode username: {}", e))
    })?;

    let owner = serde_json::from_slice::<NamespacedOwnerReference>(&decoded).map_err(|e| {
        error!(error = %e, "Could not unmarshal auth string");
        Error::OwnerReferenceError(format!("could not unmarshal auth string: {}", e))
    })?;

    Ok(Some(owner))
}

/// Username of a well-formed Basic `Authorization` header
fn basic_auth_username(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    const PREFIX: &str = "Basic ";
    if value.len() < PREFIX.len() || !value[..PREFIX.len()].eq_ignore_ascii_case(PREFIX) {
        return None;
    }
    let credentials = STANDARD.decode(&value[PREFIX.len()..]).ok()?;
    let credentials = String::from_utf8(credentials).ok()?;
    let (user, _password) = credentials.split_once(':')?;
    Some(user.to_string())
}
