//! Local informer cache over dynamic objects
//!
//! Informers are started lazily, one per kind, the first time a kind is read
//! or subscribed to. Each informer keeps a reflector store for reads and
//! broadcasts its events to dependent watches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::gvk_key;
use crate::watches::{EventSource, ObjectEvent, Subscription};
use crate::{Error, Result};

/// How long a read waits for a new informer to list its kind
pub const CACHE_ESTABLISHMENT_TIMEOUT: Duration = Duration::from_secs(6);

/// Pending events per informer before slow subscribers lag
const EVENT_BUFFER: usize = 1024;

/// Reads served from a local copy of cluster state
#[async_trait]
pub trait ObjectCache: Send + Sync {
    /// One object; `namespace` is empty for cluster-scoped kinds
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<DynamicObject>>>;

    /// Objects of a kind; an empty `namespace` lists every namespace
    async fn list(&self, resource: &ApiResource, namespace: &str) -> Result<Vec<Arc<DynamicObject>>>;
}

struct Informer {
    store: Store<DynamicObject>,
    events: broadcast::Sender<ObjectEvent>,
}

impl Informer {
    async fn ready(&self, resource: &ApiResource) -> Result<()> {
        match tokio::time::timeout(CACHE_ESTABLISHMENT_TIMEOUT, self.store.wait_until_ready()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::CacheError(format!(
                "informer for {} stopped",
                resource.kind
            ))),
            Err(_) => Err(Error::CacheError(format!(
                "timed out waiting for informer for {}",
                resource.kind
            ))),
        }
    }
}

/// Cache of lazily started cluster-wide informers
pub struct InformerCache {
    client: Client,
    informers: DashMap<String, Arc<Informer>>,
    token: CancellationToken,
}

impl InformerCache {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            informers: DashMap::new(),
            token: CancellationToken::new(),
        }
    }

    /// Run until `token` is cancelled, then stop every informer
    pub async fn start(&self, token: CancellationToken) {
        token.cancelled().await;
        info!(informers = self.informers.len(), "Stopping informer cache");
        self.token.cancel();
    }

    /// Wait for every informer started so far to finish its initial list
    pub async fn wait_for_initial_sync(&self) -> bool {
        let informers: Vec<_> = self
            .informers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for informer in informers {
            if informer.store.wait_until_ready().await.is_err() {
                return false;
            }
        }
        true
    }

    fn informer(&self, resource: &ApiResource) -> Arc<Informer> {
        let key = gvk_key(&kube::core::GroupVersionKind::gvk(
            &resource.group,
            &resource.version,
            &resource.kind,
        ));
        self.informers
            .entry(key)
            .or_insert_with(|| self.spawn_informer(resource))
            .value()
            .clone()
    }

    fn spawn_informer(&self, resource: &ApiResource) -> Arc<Informer> {
        debug!(kind = %resource.kind, "Starting informer");
        let api = Api::<DynamicObject>::all_with(self.client.clone(), resource);
        let writer = reflector::store::Writer::new(resource.clone());
        let store = writer.as_reader();
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .boxed();
        tokio::spawn(run_informer(
            stream,
            events.clone(),
            self.token.child_token(),
            resource.kind.clone(),
        ));

        Arc::new(Informer { store, events })
    }
}

async fn run_informer(
    mut stream: futures::stream::BoxStream<
        'static,
        std::result::Result<watcher::Event<DynamicObject>, watcher::Error>,
    >,
    events: broadcast::Sender<ObjectEvent>,
    token: CancellationToken,
    kind: String,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(event)) => publish(&events, event),
                Some(Err(e)) => warn!(kind = %kind, error = %e, "Informer watch error"),
                None => break,
            },
        }
    }
    debug!(kind = %kind, "Informer stopped");
}

fn publish(events: &broadcast::Sender<ObjectEvent>, event: watcher::Event<DynamicObject>) {
    let event = match event {
        watcher::Event::Apply(obj) => ObjectEvent::Applied(Arc::new(obj)),
        watcher::Event::Delete(obj) => ObjectEvent::Deleted(Arc::new(obj)),
        watcher::Event::InitApply(obj) => ObjectEvent::Listed(Arc::new(obj)),
        watcher::Event::Init | watcher::Event::InitDone => return,
    };
    // no subscribers is fine
    let _ = events.send(event);
}

#[async_trait]
impl ObjectCache for InformerCache {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<DynamicObject>>> {
        let informer = self.informer(resource);
        informer.ready(resource).await?;

        let mut key = ObjectRef::new_with(name, resource.clone());
        if !namespace.is_empty() {
            key = key.within(namespace);
        }
        Ok(informer.store.get(&key))
    }

    async fn list(&self, resource: &ApiResource, namespace: &str) -> Result<Vec<Arc<DynamicObject>>> {
        let informer = self.informer(resource);
        informer.ready(resource).await?;

        Ok(informer
            .store
            .state()
            .into_iter()
            .filter(|obj| namespace.is_empty() || obj.namespace().as_deref() == Some(namespace))
            .collect())
    }
}

impl EventSource for InformerCache {
    fn subscribe(&self, resource: &ApiResource) -> Result<Subscription> {
        let informer = self.informer(resource);
        // subscribe before the snapshot so nothing falls between the two
        let events = informer.events.subscribe();
        Ok(Subscription {
            events,
            existing: informer.store.state(),
        })
    }
}
