//! Request handlers composing the proxy
//!
//! Each handler wraps the next one. Requests arrive fully buffered so a
//! handler can inspect and rewrite the body before passing it on; responses
//! stream.

pub mod auth;
pub mod cache_response;
pub mod inject_owner;
pub mod logging;
pub mod upstream;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde_json::{json, Value};

pub use auth::RemoveAuthorization;
pub use cache_response::CacheResponse;
pub use inject_owner::InjectOwner;
pub use logging::RequestLog;
pub use upstream::Upstream;

use crate::controllermap::ControllerMap;
use crate::discovery::{ApiResources, RestMapper};
use crate::requestinfo::RequestInfoFactory;
use crate::watches::DependentWatchRegistrar;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// State shared by the owner injection and cache handlers
pub struct Context {
    pub factory: RequestInfoFactory,
    pub mapper: Arc<dyn RestMapper>,
    pub api_resources: Arc<ApiResources>,
    pub controllers: Arc<dyn ControllerMap>,
    pub registrar: Arc<DependentWatchRegistrar>,
    /// Namespaces whose dependents are watched; `""` means all of them
    pub watched_namespaces: HashSet<String>,
}

impl Context {
    pub fn is_watched(&self, namespace: &str) -> bool {
        self.watched_namespaces.contains("") || self.watched_namespaces.contains(namespace)
    }
}

/// Response body shared by every handler
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// One stage of the proxy
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request<Bytes>) -> Response<ProxyBody>;
}

/// Wraps the upstream handler with caller supplied behaviour
pub type HandlerChain = Box<dyn FnOnce(Arc<dyn Handler>) -> Arc<dyn Handler> + Send>;

/// Paths never answered from the cache or used to start watches
pub const DEFAULT_SKIP_PATTERNS: &[&str] = &["/api/*/pods/*/exec", "/api/*/pods/*/attach"];

/// Whether `target` starts with something `pattern` matches, `*` matching
/// any run of characters
pub fn matches_skip_pattern(pattern: &str, target: &str) -> bool {
    fn prefix_match(pattern: &[u8], target: &[u8]) -> bool {
        match pattern.split_first() {
            None => true,
            Some((b'*', rest)) => (0..=target.len()).any(|i| prefix_match(rest, &target[i..])),
            Some((c, rest)) => target
                .split_first()
                .is_some_and(|(t, target)| t == c && prefix_match(rest, target)),
        }
    }
    prefix_match(pattern.as_bytes(), target.as_bytes())
}

pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// 200 with a JSON document
pub fn json_response(value: &Value) -> Response<ProxyBody> {
    let mut response = Response::new(full(value.to_string()));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Failure rendered as a Kubernetes `Status` object
pub fn status_response(code: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let reason = match code {
        StatusCode::BAD_REQUEST => "BadRequest",
        StatusCode::NOT_FOUND => "NotFound",
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => "ServiceUnavailable",
        _ => "InternalError",
    };
    let status = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message.into(),
        "reason": reason,
        "code": code.as_u16(),
    });

    let mut response = json_response(&status);
    *response.status_mut() = code;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_patterns_match_exec_and_attach() {
        let exec = "/api/v1/namespaces/default/pods/web-0/exec?command=ls&stdout=true";
        let attach = "/api/v1/namespaces/default/pods/web-0/attach";
        assert!(DEFAULT_SKIP_PATTERNS
            .iter()
            .any(|p| matches_skip_pattern(p, exec)));
        assert!(DEFAULT_SKIP_PATTERNS
            .iter()
            .any(|p| matches_skip_pattern(p, attach)));
    }

    #[test]
    fn skip_patterns_leave_other_paths() {
        for path in [
            "/api/v1/namespaces/default/pods/web-0",
            "/api/v1/namespaces/default/pods/web-0/log",
            "/apis/apps/v1/namespaces/default/deployments/exec",
        ] {
            assert!(
                !DEFAULT_SKIP_PATTERNS
                    .iter()
                    .any(|p| matches_skip_pattern(p, path)),
                "{path} should not be skipped"
            );
        }
    }

    #[test]
    fn skip_patterns_are_anchored_at_the_start() {
        assert!(!matches_skip_pattern("/api/*/exec", "/proxy/api/v1/exec"));
        assert!(matches_skip_pattern("/api/*/exec", "/api/v1/exec"));
    }

    #[test]
    fn status_response_is_a_kubernetes_status() {
        let response = status_response(StatusCode::BAD_REQUEST, "bad body");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
