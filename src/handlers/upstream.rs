//! Forwarding to the control plane

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, CONTENT_LENGTH, HOST};
use hyper::{Request, Response, StatusCode};
use kube::Client;
use tracing::{debug, error};

use super::{status_response, BoxError, Handler, ProxyBody};

/// Headers that describe a single connection rather than the message
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Sends requests to the control plane through the kube client, which
/// supplies the base URL, TLS and the proxy's credentials
#[derive(Clone)]
pub struct Upstream {
    client: Client,
}

impl Upstream {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Handler for Upstream {
    async fn handle(&self, req: Request<Bytes>) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(HOST);
        parts.headers.remove(CONTENT_LENGTH);

        debug!(method = %parts.method, uri = %parts.uri, "Forwarding request");
        let req = Request::from_parts(parts, kube::client::Body::from(body.to_vec()));

        match self.client.send(req).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                let body = body.map_err(|e| -> BoxError { e.into() }).boxed_unsync();
                Response::from_parts(parts, body)
            }
            Err(e) => {
                error!(error = %e, "Upstream request failed");
                status_response(
                    StatusCode::BAD_GATEWAY,
                    format!("error trying to reach the control plane: {}", e),
                )
            }
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(HeaderName::from_static(name));
    }
}
