//! Resource-access interpretation of raw API requests
//!
//! Reproduces the API server's own request router so that the proxy agrees
//! with the control plane on what a path means. Valid inputs:
//!
//! ```text
//! Resource paths
//! /apis/{api-group}/{version}/namespaces
//! /api/{version}/namespaces
//! /api/{version}/namespaces/{namespace}
//! /api/{version}/namespaces/{namespace}/{resource}
//! /api/{version}/namespaces/{namespace}/{resource}/{resourceName}
//! /api/{version}/{resource}
//! /api/{version}/{resource}/{resourceName}
//!
//! Special verbs without subresources:
//! /api/{version}/proxy/{resource}/{resourceName}
//! /api/{version}/proxy/namespaces/{namespace}/{resource}/{resourceName}
//!
//! Special verbs with subresources:
//! /api/{version}/watch/{resource}
//! /api/{version}/watch/namespaces/{namespace}/{resource}
//!
//! NonResource paths
//! /apis/{api-group}/{version}
//! /apis/{api-group}
//! /apis
//! /api/{version}
//! /api
//! /healthz
//! ```

pub mod list_options;

use std::collections::HashSet;

use hyper::{Method, Request};
use tracing::error;

pub use list_options::{selector_as_equality_map, FieldSelector, ListOptions};

use crate::{Error, Result};

/// Path verbs that are not CRUD operations on the object itself
const SPECIAL_VERBS: [&str; 2] = ["proxy", "watch"];

/// Special verbs that never carry a subresource
const SPECIAL_VERBS_NO_SUBRESOURCES: [&str; 1] = ["proxy"];

/// Subresources of a namespace, as opposed to resources within it
const NAMESPACE_SUBRESOURCES: [&str; 2] = ["status", "finalize"];

/// Information parsed from an API request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// Whether the request targets an API resource or subresource
    pub is_resource_request: bool,
    /// URL path of the request
    pub path: String,
    /// Kubernetes verb (list, watch, deletecollection, ...) for resource
    /// requests; the lowercased HTTP method otherwise
    pub verb: String,
    pub api_prefix: String,
    pub api_group: String,
    pub api_version: String,
    /// Empty for cluster-scoped requests
    pub namespace: String,
    /// Plural resource name, e.g. `pods`
    pub resource: String,
    /// e.g. `status` for `/pods/foo/status`
    pub subresource: String,
    /// Set when the path, or an exact `metadata.name` field selector, names
    /// a single object
    pub name: String,
    /// Path segments starting at `{resource}/{name}`
    pub parts: Vec<String>,
}

/// Recognised API prefixes
#[derive(Clone, Debug)]
pub struct RequestInfoFactory {
    /// Without leading and trailing slashes
    pub api_prefixes: HashSet<String>,
    /// Prefixes that have no group segment
    pub groupless_api_prefixes: HashSet<String>,
}

impl Default for RequestInfoFactory {
    fn default() -> Self {
        Self {
            api_prefixes: ["api", "apis"].iter().map(|s| s.to_string()).collect(),
            groupless_api_prefixes: ["api"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Mutable state threaded through the parse stages
struct ParseState<'a> {
    info: RequestInfo,
    segments: Vec<&'a str>,
    cursor: usize,
}

impl<'a> ParseState<'a> {
    fn remaining(&self) -> &[&'a str] {
        &self.segments[self.cursor..]
    }

    fn consume(&mut self) -> &'a str {
        let segment = self.segments[self.cursor];
        self.cursor += 1;
        segment
    }
}

impl RequestInfoFactory {
    /// Parse the request info of an HTTP request
    pub fn from_request<B>(&self, req: &Request<B>) -> Result<RequestInfo> {
        self.new_request_info(req.method(), req.uri().path(), req.uri().query())
    }

    /// Parse a method, path and raw query string into a [`RequestInfo`].
    ///
    /// Short or unrecognised paths degrade to a non-resource request. The
    /// only failure is a special verb with nothing after it.
    pub fn new_request_info(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
    ) -> Result<RequestInfo> {
        let mut state = ParseState {
            info: RequestInfo {
                is_resource_request: false,
                path: path.to_string(),
                verb: method.as_str().to_lowercase(),
                ..Default::default()
            },
            segments: split_path(path),
            cursor: 0,
        };

        if !self.consume_api_prefix(&mut state) {
            return Ok(state.info);
        }

        state.info.is_resource_request = true;
        state.info.api_version = state.consume().to_string();

        consume_verb(&mut state, method)?;
        consume_namespace(&mut state);
        assign_parts(&mut state);
        disambiguate_get(&mut state.info, query);
        disambiguate_delete(&mut state.info);

        Ok(state.info)
    }

    /// Prefix and group; false when this is not a resource request
    fn consume_api_prefix(&self, state: &mut ParseState<'_>) -> bool {
        if state.remaining().len() < 3 {
            return false;
        }
        if !self.api_prefixes.contains(state.remaining()[0]) {
            return false;
        }
        state.info.api_prefix = state.consume().to_string();

        if !self.groupless_api_prefixes.contains(&state.info.api_prefix) {
            // the prefix is already consumed, so this asks for four parts
            if state.remaining().len() < 3 {
                return false;
            }
            state.info.api_group = state.consume().to_string();
        }
        true
    }
}

fn consume_verb(state: &mut ParseState<'_>, method: &Method) -> Result<()> {
    if SPECIAL_VERBS.contains(&state.remaining()[0]) {
        if state.remaining().len() < 2 {
            return Err(Error::RequestInfoError(format!(
                "unable to determine kind and namespace from url {}",
                state.info.path
            )));
        }
        state.info.verb = state.consume().to_string();
        return Ok(());
    }

    state.info.verb = match *method {
        Method::POST => "create",
        Method::GET | Method::HEAD => "get",
        Method::PUT => "update",
        Method::PATCH => "patch",
        Method::DELETE => "delete",
        _ => "",
    }
    .to_string();
    Ok(())
}

/// `/namespaces/{namespace}/{kind}/*` is rewritten relative to the kind
fn consume_namespace(state: &mut ParseState<'_>) {
    let remaining = state.remaining();
    if remaining[0] != "namespaces" {
        state.info.namespace = String::new();
        return;
    }
    if remaining.len() > 1 {
        let namespace = remaining[1].to_string();
        let shift = remaining.len() > 2 && !NAMESPACE_SUBRESOURCES.contains(&remaining[2]);
        state.info.namespace = namespace;
        if shift {
            state.cursor += 2;
        }
    }
}

/// parts look like resource/resourceName/subresource/other/stuff
fn assign_parts(state: &mut ParseState<'_>) {
    let info = &mut state.info;
    info.parts = state.segments[state.cursor..]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let depth = match info.parts.len() {
        n if n >= 3 && !SPECIAL_VERBS_NO_SUBRESOURCES.contains(&info.verb.as_str()) => 3,
        n if n >= 2 => 2,
        n => n.min(1),
    };
    if depth >= 3 {
        info.subresource = info.parts[2].clone();
    }
    if depth >= 2 {
        info.name = info.parts[1].clone();
    }
    if depth >= 1 {
        info.resource = info.parts[0].clone();
    }
}

/// A nameless get is really a list or a watch
fn disambiguate_get(info: &mut RequestInfo, query: Option<&str>) {
    if !info.name.is_empty() || info.verb != "get" {
        return;
    }

    let opts = match ListOptions::from_query(query) {
        Ok(opts) => opts,
        Err(e) => {
            error!(error = %e, path = %info.path, "Could not parse request");
            ListOptions::watch_only(query)
        }
    };

    info.verb = if opts.watch { "watch" } else { "list" }.to_string();

    if let Some(name) = opts
        .field_selector
        .as_ref()
        .and_then(|fs| fs.requires_exact_match("metadata.name"))
    {
        if list_options::is_valid_path_segment_name(name) {
            info.name = name.to_string();
        }
    }
}

/// A nameless delete is really a deletecollection
fn disambiguate_delete(info: &mut RequestInfo) {
    if info.name.is_empty() && info.verb == "delete" {
        info.verb = "deletecollection".to_string();
    }
}

/// Non-empty segments of a URL path
fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
