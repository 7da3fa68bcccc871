//! Turning child events into owner reconcile requests

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::{ControllerHandle, DependentWatch, EnqueueStrategy, ObjectEvent, Subscription};
use crate::discovery::parse_group_version;
use crate::metrics::prometheus::ENQUEUED_REQUESTS;
use crate::owner::{PRIMARY_RESOURCE_ANNOTATION, PRIMARY_RESOURCE_TYPE_ANNOTATION};
use crate::Result;

/// Owner to reconcile
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    pub name: String,
    /// None for cluster-scoped owners
    pub namespace: Option<String>,
}

/// [`ControllerHandle`] feeding an unbounded reconcile queue
#[derive(Clone)]
pub struct QueueController {
    queue: mpsc::UnboundedSender<ReconcileRequest>,
}

impl QueueController {
    pub fn new(queue: mpsc::UnboundedSender<ReconcileRequest>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl ControllerHandle for QueueController {
    async fn watch(&self, watch: DependentWatch) -> Result<()> {
        let Subscription { events, existing } = watch.source.subscribe(&watch.resource)?;

        let mut predicate = DependentPredicate::default();
        for obj in existing {
            predicate.remember(obj);
        }

        debug!(
            kind = %watch.resource.kind,
            strategy = watch.handler.name(),
            "Dispatching dependent events"
        );
        tokio::spawn(dispatch(events, predicate, watch.handler, self.queue.clone()));
        Ok(())
    }
}

async fn dispatch(
    mut events: broadcast::Receiver<ObjectEvent>,
    mut predicate: DependentPredicate,
    handler: EnqueueStrategy,
    queue: mpsc::UnboundedSender<ReconcileRequest>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Dependent event receiver lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let Some(obj) = predicate.admit(&event) else {
            continue;
        };
        for request in requests_for(&handler, &obj) {
            info!(
                event = event_type(&event),
                kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default(),
                name = %request.name,
                namespace = request.namespace.as_deref().unwrap_or_default(),
                "Enqueueing owner of dependent resource"
            );
            if queue.send(request).is_err() {
                debug!("Reconcile queue closed, stopping dependent dispatch");
                return;
            }
            ENQUEUED_REQUESTS
                .with_label_values(&[handler.owner_kind()])
                .inc();
        }
    }
}

fn event_type(event: &ObjectEvent) -> &'static str {
    match event {
        ObjectEvent::Listed(_) => "list",
        ObjectEvent::Applied(_) => "apply",
        ObjectEvent::Deleted(_) => "delete",
    }
}

impl EnqueueStrategy {
    fn owner_kind(&self) -> &str {
        match self {
            EnqueueStrategy::Owner { owner, .. } => &owner.kind,
            EnqueueStrategy::Annotation { owner } => &owner.kind,
        }
    }
}

/// Filters dependent events down to meaningful changes.
///
/// Listed objects and creations are only remembered. Updates pass when
/// something other than status, resource version or managed fields changed.
/// Deletions always pass.
#[derive(Default)]
struct DependentPredicate {
    last_seen: HashMap<(Option<String>, String), Arc<DynamicObject>>,
}

impl DependentPredicate {
    fn remember(&mut self, obj: Arc<DynamicObject>) -> Option<Arc<DynamicObject>> {
        self.last_seen.insert(object_key(&obj), obj)
    }

    fn admit(&mut self, event: &ObjectEvent) -> Option<Arc<DynamicObject>> {
        match event {
            ObjectEvent::Listed(obj) => {
                self.remember(obj.clone());
                None
            }
            ObjectEvent::Applied(obj) => {
                let previous = self.remember(obj.clone())?;
                if significant(&previous) == significant(obj) {
                    None
                } else {
                    Some(obj.clone())
                }
            }
            ObjectEvent::Deleted(obj) => {
                self.last_seen.remove(&object_key(obj));
                Some(obj.clone())
            }
        }
    }
}

fn object_key(obj: &DynamicObject) -> (Option<String>, String) {
    (obj.namespace(), obj.name_any())
}

/// The object without the fields every write churns
fn significant(obj: &DynamicObject) -> Value {
    let mut value = match serde_json::to_value(obj) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "Could not serialize dependent object");
            return Value::Null;
        }
    };
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
        if let Some(metadata) = map.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.remove("resourceVersion");
            metadata.remove("managedFields");
        }
    }
    value
}

/// Owners of `obj` to reconcile under `handler`
fn requests_for(handler: &EnqueueStrategy, obj: &DynamicObject) -> Vec<ReconcileRequest> {
    match handler {
        EnqueueStrategy::Owner {
            owner,
            owner_namespaced,
        } => obj
            .owner_references()
            .iter()
            .filter(|reference| {
                let (group, _) = parse_group_version(&reference.api_version);
                reference.kind == owner.kind && group == owner.group
            })
            .map(|reference| ReconcileRequest {
                name: reference.name.clone(),
                namespace: if *owner_namespaced { obj.namespace() } else { None },
            })
            .collect(),
        EnqueueStrategy::Annotation { owner } => {
            let annotations = obj.annotations();
            let Some(owner_type) = annotations.get(PRIMARY_RESOURCE_TYPE_ANNOTATION) else {
                return vec![];
            };
            if *owner_type != owner.to_string() {
                return vec![];
            }
            let Some(primary) = annotations.get(PRIMARY_RESOURCE_ANNOTATION) else {
                return vec![];
            };
            match primary.split('/').collect::<Vec<_>>().as_slice() {
                [name] => vec![ReconcileRequest {
                    name: name.to_string(),
                    namespace: None,
                }],
                [namespace, name] => vec![ReconcileRequest {
                    name: name.to_string(),
                    namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
                }],
                _ => {
                    error!(annotation = %primary, "Malformed primary resource annotation");
                    vec![]
                }
            }
        }
    }
}
