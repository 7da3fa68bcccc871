//! Request logging

use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Request, Response};
use tracing::info;

use super::{Handler, ProxyBody};

/// Logs method, URI and body of every request, then passes it on unchanged
pub struct RequestLog {
    next: Arc<dyn Handler>,
}

impl RequestLog {
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Handler for RequestLog {
    async fn handle(&self, req: Request<Bytes>) -> Response<ProxyBody> {
        info!(
            method = %req.method(),
            uri = %req.uri(),
            body = %String::from_utf8_lossy(req.body()),
            "Request"
        );
        self.next.handle(req).await
    }
}
