//! Strips the owner identity before requests leave the proxy

use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::{Request, Response};

use super::{Handler, ProxyBody};

/// Removes the inbound `Authorization` header. Upstream requests carry the
/// proxy's own credentials instead.
pub struct RemoveAuthorization {
    next: Arc<dyn Handler>,
}

impl RemoveAuthorization {
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Handler for RemoveAuthorization {
    async fn handle(&self, mut req: Request<Bytes>) -> Response<ProxyBody> {
        req.headers_mut().remove(AUTHORIZATION);
        self.next.handle(req).await
    }
}
