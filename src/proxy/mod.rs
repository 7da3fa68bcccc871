//! Proxy bootstrap
//!
//! Assembles the handler chain, warms the local cache and serves the proxy
//! on a TCP listener.

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use kube::Client;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::InformerCache;
use crate::controllermap::ControllerMap;
use crate::discovery::{
    ApiResources, DiscoveryClient, DynamicRestMapper, KubeDiscoveryClient, RestMapper,
};
use crate::handlers::{
    status_response, CacheResponse, Context, Handler, HandlerChain, InjectOwner, ProxyBody,
    RemoveAuthorization, RequestLog, Upstream,
};
use crate::metrics::prometheus::{PROXY_HEALTH, PROXY_REQUESTS};
use crate::requestinfo::RequestInfoFactory;
use crate::watches::DependentWatchRegistrar;
use crate::{Error, Result};

/// Default listen address
pub const DEFAULT_ADDRESS: &str = "localhost";

/// Default listen port
pub const DEFAULT_PORT: u16 = 8888;

/// Proxy configuration
pub struct Options {
    pub address: String,
    pub port: u16,
    /// Wraps the upstream handler before the proxy's own handlers
    pub handler: Option<HandlerChain>,
    /// Control plane connection used for forwarding, discovery and informers
    pub client: Client,
    /// Shared cache; one is created and synced when absent
    pub cache: Option<Arc<InformerCache>>,
    /// Defaults to a discovery backed mapper
    pub rest_mapper: Option<Arc<dyn RestMapper>>,
    pub controller_map: Option<Arc<dyn ControllerMap>>,
    /// `""` watches every namespace
    pub watched_namespaces: Option<HashSet<String>>,
    pub disable_cache: bool,
    pub owner_injection: bool,
    pub log_requests: bool,
}

impl Options {
    pub fn new(client: Client) -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            handler: None,
            client,
            cache: None,
            rest_mapper: None,
            controller_map: None,
            watched_namespaces: None,
            disable_cache: false,
            owner_injection: true,
            log_requests: false,
        }
    }
}

/// Start the proxy.
///
/// Returns the bound address once the listener is up; the accept loop keeps
/// running in the background and reports its terminal error on `done`.
pub async fn run(done: oneshot::Sender<Error>, options: Options) -> Result<SocketAddr> {
    let Options {
        address,
        port,
        handler,
        client,
        cache,
        rest_mapper,
        controller_map,
        watched_namespaces,
        disable_cache,
        owner_injection,
        log_requests,
    } = options;

    let controllers = controller_map
        .ok_or_else(|| Error::ConfigError("failed to get controller map from options".to_string()))?;
    let watched_namespaces = watched_namespaces.ok_or_else(|| {
        Error::ConfigError("failed to get list of watched namespaces from options".to_string())
    })?;

    let discovery: Arc<dyn DiscoveryClient> = Arc::new(KubeDiscoveryClient::new(client.clone()));
    let mapper = rest_mapper
        .unwrap_or_else(|| Arc::new(DynamicRestMapper::new(discovery.clone())) as Arc<dyn RestMapper>);
    let api_resources = Arc::new(ApiResources::new(discovery));

    let cache = match cache {
        Some(cache) => cache,
        None => {
            let cache = Arc::new(InformerCache::new(client.clone()));
            if !disable_cache {
                info!("Initializing and starting informer cache");
                let background = cache.clone();
                let token = CancellationToken::new();
                tokio::spawn(async move {
                    background.start(token.clone()).await;
                    token.cancel();
                });

                info!("Waiting for cache to sync");
                if !cache.wait_for_initial_sync().await {
                    return Err(Error::CacheError("failed to sync cache".to_string()));
                }
                info!("Cache sync was successful");
            }
            cache
        }
    };

    let registrar = Arc::new(DependentWatchRegistrar::new(
        mapper.clone(),
        controllers.clone(),
        cache.clone(),
    ));
    let ctx = Arc::new(Context {
        factory: RequestInfoFactory::default(),
        mapper,
        api_resources,
        controllers,
        registrar,
        watched_namespaces,
    });

    let mut chain: Arc<dyn Handler> = Arc::new(Upstream::new(client));
    if let Some(wrap) = handler {
        chain = wrap(chain);
    }
    chain = Arc::new(RemoveAuthorization::new(chain));
    if owner_injection {
        chain = Arc::new(InjectOwner::new(chain, ctx.clone()));
    } else {
        warn!("Injection of owner references and dependent watches is turned off");
    }
    if log_requests {
        chain = Arc::new(RequestLog::new(chain));
    }
    if !disable_cache {
        chain = Arc::new(CacheResponse::new(chain, ctx, cache, owner_injection));
    }

    let listener = TcpListener::bind((address.as_str(), port)).await?;
    let local_addr = listener.local_addr()?;
    PROXY_HEALTH.set(1.0);

    tokio::spawn(async move {
        info!(address = %local_addr, "Starting to serve");
        let err = serve(listener, chain).await;
        PROXY_HEALTH.set(0.0);
        error!(error = %err, "Proxy stopped serving");
        // the receiver may be gone
        let _ = done.send(err);
    });

    Ok(local_addr)
}

/// Accept connections until the listener fails
async fn serve(listener: TcpListener, handler: Arc<dyn Handler>) -> Error {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => return Error::IoError(e),
        };
        let handler = handler.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(dispatch(handler, req).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(error = %e, peer = %peer, "Error serving proxy connection");
            }
        });
    }
}

/// Buffer the request body and hand the request to the chain
async fn dispatch(handler: Arc<dyn Handler>, req: Request<Incoming>) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return status_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {}", e),
            )
        }
    };
    let req = Request::from_parts(parts, body);

    let verb = RequestInfoFactory::default()
        .from_request(&req)
        .map(|info| info.verb)
        .unwrap_or_else(|_| req.method().as_str().to_lowercase());
    PROXY_REQUESTS.with_label_values(&[verb.as_str()]).inc();

    handler.handle(req).await
}
